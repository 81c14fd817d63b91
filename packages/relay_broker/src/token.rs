//! Connection tokens and the entropy source they are drawn from.
//!
//! A token is 32 random bytes identifying one side of a pending rendezvous
//! attempt. On the wire it travels as a 64-character lowercase hex string.

use std::fmt;
use std::str::FromStr;

use hex::FromHex;
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length in bytes of tokens and issued secret keys.
pub const TOKEN_LEN: usize = 32;

/// Opaque bearer credential for one side of a rendezvous attempt.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Draw a fresh token from `source`.
    pub fn generate(source: &dyn EntropySource) -> Result<Self, EntropyError> {
        random_bytes(source).map(Self)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Token {
    // Tokens are bearer credentials; keep logs to a short prefix.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}…)", &self.to_hex()[..8])
    }
}

impl FromStr for Token {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <[u8; TOKEN_LEN]>::from_hex(s).map(Self)
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The randomness source could not produce bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("entropy source unavailable: {0}")]
pub struct EntropyError(String);

impl EntropyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Source of cryptographically secure random bytes.
///
/// Implementations must fail rather than hand out degraded randomness.
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError>;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| EntropyError::new(e.to_string()))
    }
}

/// Fill a fixed-size array from `source`.
pub fn random_bytes<const N: usize>(source: &dyn EntropySource) -> Result<[u8; N], EntropyError> {
    let mut buf = [0u8; N];
    source.fill(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl EntropySource for Broken {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError::new("device gone"))
        }
    }

    #[test]
    fn os_entropy_produces_distinct_tokens() {
        let a = Token::generate(&OsEntropy).unwrap();
        let b = Token::generate(&OsEntropy).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn broken_source_propagates() {
        let err = Token::generate(&Broken).unwrap_err();
        assert!(err.to_string().contains("device gone"));
    }

    #[test]
    fn hex_parse_and_display() {
        let token = Token::from_bytes([0xab; TOKEN_LEN]);
        let hex = token.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<Token>().unwrap(), token);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!("abcd".parse::<Token>().is_err());
        assert!("zz".repeat(32).parse::<Token>().is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let token = Token::from_bytes([0x01; TOKEN_LEN]);
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn debug_is_truncated() {
        let token = Token::from_bytes([0xff; TOKEN_LEN]);
        assert_eq!(format!("{token:?}"), "Token(ffffffff…)");
    }
}
