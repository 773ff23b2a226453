//! Content digests and streaming verification.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::ModelError;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[serde(rename = "sha256")]
    Sha256,
}

impl DigestAlgorithm {
    /// Get the string representation of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }

    /// Length of the hex-encoded digest value.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            other => Err(ModelError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A content digest in `<algorithm>:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let sum = Sha256::digest(data);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(sum),
        }
    }

    /// Parse a digest string such as `sha256:9f86d0...`.
    ///
    /// # Arguments
    /// * `s` - Digest string
    ///
    /// # Returns
    /// The parsed digest, or an error for unknown algorithms and malformed hex.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let (algo, value) = s
            .split_once(':')
            .ok_or_else(|| ModelError::InvalidDigest(s.to_string()))?;
        let algorithm: DigestAlgorithm = algo.parse()?;

        let valid: bool = value.len() == algorithm.hex_len()
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(ModelError::InvalidDigest(s.to_string()));
        }

        Ok(Self {
            algorithm,
            hex: value.to_string(),
        })
    }

    /// Get the digest algorithm.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Get the hex-encoded digest value.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Create a streaming verifier that checks written bytes against this digest.
    pub fn verifier(&self) -> DigestVerifier {
        DigestVerifier {
            expected: self.clone(),
            hasher: Sha256::new(),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Streaming digest verifier.
///
/// Feed bytes through [`io::Write`], then ask whether they matched.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Sha256,
}

impl DigestVerifier {
    /// Digest the verifier was created for.
    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish hashing and return the digest of everything written.
    pub fn finalize(self) -> Digest {
        Digest {
            algorithm: self.expected.algorithm,
            hex: hex::encode(self.hasher.finalize()),
        }
    }

    /// Finish hashing and report whether the written bytes match.
    pub fn verified(self) -> bool {
        let expected: Digest = self.expected.clone();
        self.finalize() == expected
    }
}

impl io::Write for DigestVerifier {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for DigestVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestVerifier")
            .field("expected", &self.expected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const HELLO_SHA256: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_display() {
        let digest: Digest = Digest::sha256(b"hello");
        assert_eq!(digest.to_string(), HELLO_SHA256);
        assert_eq!(digest.algorithm(), DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_parse_roundtrips_display() {
        let digest: Digest = Digest::parse(HELLO_SHA256).unwrap();
        assert_eq!(digest, Digest::sha256(b"hello"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            Digest::parse("md5:abcd"),
            Err(ModelError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            Digest::parse("sha256:xyz"),
            Err(ModelError::InvalidDigest(_))
        ));
        assert!(matches!(
            Digest::parse("no-colon"),
            Err(ModelError::InvalidDigest(_))
        ));
        // Uppercase hex is not canonical.
        let upper: String = HELLO_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(Digest::parse(&upper).is_err());
    }

    #[test]
    fn test_verifier_streaming() {
        let digest: Digest = Digest::sha256(b"hello world");

        let mut verifier: DigestVerifier = digest.verifier();
        verifier.write_all(b"hello ").unwrap();
        verifier.write_all(b"world").unwrap();
        assert!(verifier.verified());

        let mut bad: DigestVerifier = digest.verifier();
        bad.write_all(b"hello there").unwrap();
        assert!(!bad.verified());
    }

    #[test]
    fn test_serde_as_string() {
        let digest: Digest = Digest::sha256(b"hello");
        let json: String = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO_SHA256));

        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
        assert!(serde_json::from_str::<Digest>("\"sha256:nothex\"").is_err());
    }
}
