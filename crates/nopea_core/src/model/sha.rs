use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::errors::{Error, Result};

/// A validated Git commit SHA, stored lowercase.
///
/// Accepts 40 hex characters (SHA-1) or 64 (SHA-256); anything else is
/// rejected so only real commit identifiers ever reach the state store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSha(String);

impl CommitSha {
    pub fn new(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let valid_len = normalized.len() == 40 || normalized.len() == 64;
        if !valid_len || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidCommitSha(s.to_string()));
        }
        Ok(CommitSha(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 7 characters, the conventional short form.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommitSha {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CommitSha::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA1: &str = "abc123abc123abc123abc123abc123abc123abcd";

    #[test]
    fn accepts_sha1_and_sha256_lengths() {
        assert!(CommitSha::new(SHA1).is_ok());
        assert!(CommitSha::new(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(CommitSha::new("").is_err());
        assert!(CommitSha::new("abc123").is_err());
        assert!(CommitSha::new(&"g".repeat(40)).is_err());
        assert!(CommitSha::new(&"a".repeat(41)).is_err());
    }

    #[test]
    fn normalizes_case() {
        let sha = CommitSha::new(&SHA1.to_uppercase()).unwrap();
        assert_eq!(sha.as_str(), SHA1);
    }

    #[test]
    fn short_form_is_seven_chars() {
        let sha = CommitSha::new(SHA1).unwrap();
        assert_eq!(sha.short(), "abc123a");
    }
}
