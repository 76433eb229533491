//! Exclusion-pattern manifest: one regex per line, `#` comments, blank
//! lines ignored (spec.md §4.3).

use regex::Regex;

use crate::error::VmError;

/// An ordered list of compiled patterns parsed from an exclusion manifest.
/// An empty (or all-comment) manifest matches nothing.
#[derive(Debug, Default)]
pub struct ExclusionMatcher {
    patterns: Vec<Regex>,
}

impl ExclusionMatcher {
    pub fn empty() -> Self {
        ExclusionMatcher {
            patterns: Vec::new(),
        }
    }

    /// Parses a manifest's text. Lines beginning with `#` (after
    /// trimming leading whitespace) and blank lines are ignored; every
    /// other line is compiled as a `regex` pattern with no implicit
    /// anchoring added (spec.md §9 Open Question: anchoring is left to
    /// the manifest author).
    pub fn from_manifest(text: &str) -> Result<Self, VmError> {
        let mut patterns = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let regex = Regex::new(trimmed).map_err(|source| VmError::InvalidExclusionPattern {
                pattern: trimmed.to_string(),
                source,
            })?;
            patterns.push(regex);
        }
        Ok(ExclusionMatcher { patterns })
    }

    pub fn is_excluded(&self, reference: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(reference))
    }
}
