//! Content digests in `algorithm:hex` form.

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Hash algorithms accepted for blob digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256, 32 byte output.
    Sha256,
}

impl Algorithm {
    /// The algorithm identifier as it appears before the `:`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The digest string was not a valid `algorithm:hex` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest {digest:?}: {reason}")]
pub struct InvalidDigest {
    digest: String,
    reason: &'static str,
}

/// A content digest identifying an immutable blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Build a SHA-256 digest from the raw 32 byte hash output.
    pub fn sha256(bytes: [u8; 32]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(bytes),
        }
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Relative storage path for this digest, e.g. `blobs/sha256/<hex>`.
    pub fn blob_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("blobs/{}/{}", self.algorithm, self.hex))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidDigest {
            digest: s.to_owned(),
            reason,
        };

        let (algorithm, hex) = s.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "" => return Err(invalid("missing algorithm")),
            _ => return Err(invalid("unsupported algorithm")),
        };

        if hex.len() != algorithm.hex_len() {
            return Err(invalid("wrong length"));
        }

        if !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid("not lowercase hex"));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "sha256:b94d27b9934d3e08a52e52d7da7dacffe4d5d4f2e1b5b3f6a1e7e4c1d3c3b1a0";

    #[test]
    fn parse_and_display() {
        let digest: Digest = SAMPLE.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), SAMPLE);
        assert_eq!(
            digest.blob_path().as_str(),
            "blobs/sha256/b94d27b9934d3e08a52e52d7da7dacffe4d5d4f2e1b5b3f6a1e7e4c1d3c3b1a0"
        );
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "sha256",
            ":abc",
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "sha256:abc",
            "sha256:B94D27B9934D3E08A52E52D7DA7DACFFE4D5D4F2E1B5B3F6A1E7E4C1D3C3B1A0",
            "sha256:../../../../etc/passwd/../../../../../../../../../../../../x",
        ] {
            assert!(bad.parse::<Digest>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn from_raw_bytes() {
        let digest = Digest::sha256([0xab; 32]);
        assert_eq!(digest.hex(), "ab".repeat(32));
    }
}
