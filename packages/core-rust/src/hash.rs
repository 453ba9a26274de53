//! Identifier hashing for channels and algorithms.
//!
//! Persistence keys are never clear-text names. Algorithm names and channel
//! properties are hashed into lowercase hex digests, which are collision
//! resistant, stable across restarts, and safe to use both as file names and
//! as SQL parameters.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256, Sha512};

/// Separator placed between channel components before hashing, so that
/// `["ab", "c"]` and `["a", "bc"]` produce different identifiers.
const COMPONENT_SEPARATOR: u8 = 0x1f;

/// Hash function used to derive persistence identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashFunction {
    #[default]
    Sha256,
    Sha512,
    Blake3,
}

impl HashFunction {
    /// Hashes `text` and returns the lowercase hex digest.
    ///
    /// # Examples
    ///
    /// ```
    /// use lbstate_core::hash::HashFunction;
    ///
    /// let id = HashFunction::Sha256.digest("proportional");
    /// assert_eq!(id.len(), 64);
    /// ```
    #[must_use]
    pub fn digest(self, text: &str) -> String {
        self.digest_bytes(text.as_bytes())
    }

    /// Derives a channel identifier from the channel's stable properties
    /// (for example host, port and peer uuid-independent settings).
    #[must_use]
    pub fn channel_id<S: AsRef<str>>(self, components: &[S]) -> String {
        let mut joined = Vec::new();
        for (i, component) in components.iter().enumerate() {
            if i > 0 {
                joined.push(COMPONENT_SEPARATOR);
            }
            joined.extend_from_slice(component.as_ref().as_bytes());
        }
        self.digest_bytes(&joined)
    }

    fn digest_bytes(self, bytes: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(Sha256::digest(bytes)),
            Self::Sha512 => hex::encode(Sha512::digest(bytes)),
            Self::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        }
    }

    /// Canonical configuration name of this function.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
            Self::Blake3 => "BLAKE3",
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown hash function name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownHashFunction(pub String);

impl fmt::Display for UnknownHashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hash function: {}", self.0)
    }
}

impl std::error::Error for UnknownHashFunction {}

impl FromStr for HashFunction {
    type Err = UnknownHashFunction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            _ => Err(UnknownHashFunction(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validate_id;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            HashFunction::Sha256.digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha512_known_vector() {
        assert_eq!(
            HashFunction::Sha512.digest("abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn blake3_matches_reference_crate() {
        let id = HashFunction::Blake3.digest("abc");
        assert_eq!(id, blake3::hash(b"abc").to_hex().to_string());
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn digests_are_valid_identifiers() {
        for f in [HashFunction::Sha256, HashFunction::Sha512, HashFunction::Blake3] {
            assert!(validate_id(&f.digest("nodethreads")).is_ok(), "{f}");
        }
    }

    #[test]
    fn channel_id_separates_components() {
        let f = HashFunction::Sha256;
        assert_ne!(f.channel_id(&["ab", "c"]), f.channel_id(&["a", "bc"]));
        assert_eq!(f.channel_id(&["host", "11111"]), f.channel_id(&["host", "11111"]));
    }

    #[test]
    fn parse_accepts_common_spellings() {
        assert_eq!("SHA-256".parse::<HashFunction>().unwrap(), HashFunction::Sha256);
        assert_eq!("sha256".parse::<HashFunction>().unwrap(), HashFunction::Sha256);
        assert_eq!("Sha_512".parse::<HashFunction>().unwrap(), HashFunction::Sha512);
        assert_eq!("blake3".parse::<HashFunction>().unwrap(), HashFunction::Blake3);
        assert!("md5".parse::<HashFunction>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for f in [HashFunction::Sha256, HashFunction::Sha512, HashFunction::Blake3] {
            assert_eq!(f.to_string().parse::<HashFunction>().unwrap(), f);
        }
    }
}
