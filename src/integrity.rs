use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("content is empty")]
    Empty,
    #[error("expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// What a bundle's content must satisfy before it is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentExpectation {
    pub len: Option<u64>,
    /// Lowercase or uppercase hex SHA-256 digest.
    pub sha256: Option<String>,
}

/// Hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub fn verify_content(data: &[u8], expected: &ContentExpectation) -> Result<(), IntegrityError> {
    if data.is_empty() {
        return Err(IntegrityError::Empty);
    }
    if let Some(len) = expected.len {
        if len != data.len() as u64 {
            return Err(IntegrityError::LengthMismatch {
                expected: len,
                actual: data.len() as u64,
            });
        }
    }
    if let Some(digest) = expected.sha256.as_deref() {
        let actual = sha256_hex(data);
        if !actual.eq_ignore_ascii_case(digest) {
            return Err(IntegrityError::ChecksumMismatch {
                expected: digest.to_ascii_lowercase(),
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello")
    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn accepts_matching_content() {
        let expected = ContentExpectation {
            len: Some(5),
            sha256: Some(HELLO.to_uppercase()),
        };
        assert_eq!(verify_content(b"hello", &expected), Ok(()));
    }

    #[test]
    fn rejects_empty_content() {
        assert_eq!(
            verify_content(b"", &ContentExpectation::default()),
            Err(IntegrityError::Empty)
        );
    }

    #[test]
    fn rejects_wrong_length_and_digest() {
        let by_len = ContentExpectation {
            len: Some(4),
            sha256: None,
        };
        assert!(matches!(
            verify_content(b"hello", &by_len),
            Err(IntegrityError::LengthMismatch { expected: 4, actual: 5 })
        ));

        let by_digest = ContentExpectation {
            len: None,
            sha256: Some(HELLO.into()),
        };
        assert!(matches!(
            verify_content(b"hellp", &by_digest),
            Err(IntegrityError::ChecksumMismatch { .. })
        ));
    }
}
