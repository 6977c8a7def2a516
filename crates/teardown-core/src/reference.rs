//! Repository reference parsing.
//!
//! Two forms are accepted, each optionally suffixed with `.git` and a
//! trailing slash:
//! - `https://github.com/<owner>/<repo>`
//! - `git@github.com:<owner>/<repo>`

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

static HTTPS_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
        .expect("valid https reference regex")
});

static SSH_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^git@github\.com:([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
        .expect("valid ssh reference regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("Unrecognized repository reference: {0}")]
    Unrecognized(String),
}

/// Owner and name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoReference {
    pub owner: String,
    pub name: String,
}

impl RepoReference {
    /// Parse an HTTPS URL or SSH shorthand into owner and name.
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let trimmed = reference.trim();
        let captures = HTTPS_REFERENCE
            .captures(trimmed)
            .or_else(|| SSH_REFERENCE.captures(trimmed))
            .ok_or_else(|| ReferenceError::Unrecognized(reference.to_string()))?;

        let owner = captures[1].to_string();
        let name = captures[2].to_string();
        if name.is_empty() {
            return Err(ReferenceError::Unrecognized(reference.to_string()));
        }

        Ok(Self { owner, name })
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for RepoReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
