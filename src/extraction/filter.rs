//! Glob-style path filters for selective extraction

use crate::error::{ExtractionError, Result};
use std::fmt;
use wax::{Glob, Pattern};

/// A set of glob patterns matched against `/`-separated relative paths
///
/// Patterns use `wax` glob syntax:
/// - `*` matches any run of characters within one path component
/// - `?` matches one character within a component
/// - `**` matches whole components across directories; `**/` also matches none
/// - `[abc]`, `[a-z]`, `[!abc]` character classes, which never match `/`
/// - `{a,b}` alternatives
///
/// A leading `./` or `/` is ignored. A path matches the filter if it matches
/// any of its patterns.
pub struct PathFilter {
    patterns: Vec<(String, Glob<'static>)>,
}

impl PathFilter {
    /// Compile a filter; at least one pattern is required
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(ExtractionError::InvalidPattern {
                pattern: String::new(),
                reason: "no patterns given (use \"**\" to select everything)".to_string(),
            }
            .into());
        }

        let compiled = patterns
            .iter()
            .map(|p| {
                let pattern = p.as_ref();
                let glob = compile_glob(pattern)?;
                Ok((pattern.to_string(), glob))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns: compiled,
        })
    }

    /// Whether `relative_path` matches any pattern
    pub fn matches(&self, relative_path: &str) -> bool {
        let path = relative_path.trim_start_matches("./");
        self.patterns.iter().any(|(_, glob)| glob.is_match(path))
    }

    /// The original patterns, in the order given
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(p, _)| p.as_str())
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFilter")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .finish()
    }
}

fn compile_glob(pattern: &str) -> Result<Glob<'static>> {
    let trimmed = pattern.trim_start_matches("./").trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ExtractionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "empty pattern".to_string(),
        }
        .into());
    }

    Glob::new(trimmed).map(Glob::into_owned).map_err(|e| {
        ExtractionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
