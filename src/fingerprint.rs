//! Deterministic, collision-resistant, length-bounded cache filenames for
//! reference strings (spec.md §4.2).

use sha2::{Digest, Sha256};

/// The cache filename must never exceed this many bytes (spec.md §3, §8).
const MAX_FILENAME_BYTES: usize = 255;
/// How much of the human-readable prefix we keep before the digest, after
/// accounting for the scheme tag, separators and the fixed-width hex
/// digest suffix.
const MAX_PREFIX_BYTES: usize = 96;

/// The reference's classified kind, used both for fingerprinting and for
/// `IncludeResolver`'s reader dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Http,
    GitHub,
    File,
}

impl ReferenceKind {
    fn tag(self) -> &'static str {
        match self {
            ReferenceKind::Http => "http",
            ReferenceKind::GitHub => "github",
            ReferenceKind::File => "file",
        }
    }
}

/// Classifies a reference string the way `IncludeResolver::resolve` does
/// (spec.md §4.4 step 1), without the `.git` rejection check — that check
/// is the resolver's job, since fingerprinting must be total over every
/// reference string, including ones that will ultimately be rejected.
pub fn classify(reference: &str) -> ReferenceKind {
    let lower = reference.to_ascii_lowercase();
    if lower.starts_with("http:") || lower.starts_with("https:") {
        ReferenceKind::Http
    } else if lower.starts_with("github:") {
        ReferenceKind::GitHub
    } else {
        ReferenceKind::File
    }
}

/// `(path, kind, display_name)` for a reference string, per spec.md §4.2.
///
/// The digest is computed over the *full* reference string (scheme, path,
/// `@ref`, and `?query` all included verbatim) so that references which
/// differ only in a ref or query string still fingerprint to distinct
/// paths — `a/b/c.js` and `a/b/c.js@a` hash differently because the
/// digest input differs, even though the human-readable prefix derived
/// from the path component alone would be identical.
pub fn fingerprint(reference: &str) -> (String, ReferenceKind, String) {
    let kind = classify(reference);
    let display = display_name(reference, kind);
    let prefix = sanitize_prefix(&display);

    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let path = format!("{}-{}-{}", kind.tag(), prefix, hex);
    debug_assert!(path.len() <= MAX_FILENAME_BYTES);
    (path, kind, display)
}

/// Just the fingerprinted path, for callers that don't need the kind or
/// display name (`FileCache::cached_path`).
pub fn fingerprint_path(reference: &str) -> String {
    fingerprint(reference).0
}

fn display_name(reference: &str, kind: ReferenceKind) -> String {
    match kind {
        ReferenceKind::Http => {
            let without_scheme = reference
                .split_once("://")
                .map(|(_, rest)| rest)
                .unwrap_or(reference);
            without_scheme.split('?').next().unwrap_or(without_scheme).to_string()
        }
        ReferenceKind::GitHub => {
            let rest = reference.strip_prefix("github:").unwrap_or(reference);
            rest.split('@').next().unwrap_or(rest).to_string()
        }
        ReferenceKind::File => reference.to_string(),
    }
}

/// Replaces path separators and any byte outside `[A-Za-z0-9._-]` with
/// `_`, then caps the result to `MAX_PREFIX_BYTES` bytes (at a char
/// boundary) so the final filename stays under the 255-byte bound
/// regardless of input length (spec.md §8: "a reference >= 256 characters
/// still yields a cached path < 256 characters").
fn sanitize_prefix(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() <= MAX_PREFIX_BYTES {
        return sanitized;
    }
    let mut truncated = String::new();
    for c in sanitized.chars() {
        if truncated.len() + c.len_utf8() > MAX_PREFIX_BYTES {
            break;
        }
        truncated.push(c);
    }
    truncated
}
