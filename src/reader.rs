//! Readers: the capability set that actually fetches a reference's bytes
//! (spec.md §6, §9 "Readers as a capability set").

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ReaderError {
    #[error("failed to read \"{reference}\": {message}")]
    Io {
        reference: String,
        message: String,
    },
    #[error("http request for \"{reference}\" failed: {message}")]
    Http {
        reference: String,
        message: String,
    },
    #[error("http request for \"{reference}\" returned status {status}")]
    HttpStatus { reference: String, status: u16 },

    #[error("GIT sources are not supported: {reference}")]
    GitUnsupported { reference: String },
}

/// Capability for fetching a reference's raw bytes, keyed by scheme
/// (spec.md §6: "Readers ... keyed by scheme `{http, file}`").
pub trait Reader {
    fn read(&self, reference: &str) -> Result<Vec<u8>, ReaderError>;
}

/// Reads local filesystem paths, resolved relative to `base_dir` when the
/// reference is not already absolute. Also handles `github:` shorthand by
/// turning it into a `raw.githubusercontent.com` URL and delegating to a
/// blocking HTTP fetch, per the coupling decision in SPEC_FULL.md §4.4.
pub struct FileReader {
    base_dir: PathBuf,
    http: HttpReader,
}

impl FileReader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileReader {
            base_dir: base_dir.into(),
            http: HttpReader::new(),
        }
    }

    fn resolve_path(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn github_raw_url(reference: &str) -> Option<String> {
        let rest = reference.strip_prefix("github:")?;
        let (path_and_ref, ref_part) = match rest.split_once('@') {
            Some((p, r)) => (p, r),
            None => (rest, "HEAD"),
        };
        let mut segments = path_and_ref.splitn(3, '/');
        let owner = segments.next()?;
        let repo = segments.next()?;
        let path = segments.next()?;
        Some(format!(
            "https://raw.githubusercontent.com/{}/{}/{}/{}",
            owner, repo, ref_part, path
        ))
    }
}

impl Reader for FileReader {
    fn read(&self, reference: &str) -> Result<Vec<u8>, ReaderError> {
        if let Some(url) = Self::github_raw_url(reference) {
            debug!("resolving github shorthand \"{}\" via {}", reference, url);
            return self.http.read(&url);
        }

        let path = self.resolve_path(reference);
        fs::read(&path).map_err(|e| ReaderError::Io {
            reference: reference.to_string(),
            message: e.to_string(),
        })
    }
}

/// Blocking HTTP(S) reader, matching spec.md §5's single-threaded,
/// synchronous requirement — no async runtime.
pub struct HttpReader {
    client: reqwest::blocking::Client,
}

impl Default for HttpReader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpReader {
    pub fn new() -> Self {
        HttpReader {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Reader for HttpReader {
    fn read(&self, reference: &str) -> Result<Vec<u8>, ReaderError> {
        let response = self
            .client
            .get(reference)
            .send()
            .map_err(|e| ReaderError::Http {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ReaderError::HttpStatus {
                reference: reference.to_string(),
                status: response.status().as_u16(),
            });
        }

        response.bytes().map(|b| b.to_vec()).map_err(|e| ReaderError::Http {
            reference: reference.to_string(),
            message: e.to_string(),
        })
    }
}
