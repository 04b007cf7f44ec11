//! Minimal object-id type shared by the request classifier and materializer.
//!
//! Trimmed down from the notion of a full `ObjectHash` type: Goblet never
//! hashes object content itself (pack generation is delegated to
//! `git-upload-pack`), it only needs to validate and hash the *text* of the
//! OIDs clients send in `want`/`have` lines.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum HashKind {
    #[default]
    Sha1,
    Sha256,
}

impl HashKind {
    pub const fn hex_len(self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha256 => 64,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            _ => Err(()),
        }
    }
}

/// A validated, lowercase hex object id. Stored as text: Goblet never needs
/// the raw bytes, only stable comparison and inclusion in the fingerprint
/// hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let len = text.len();
        if len != HashKind::Sha1.hex_len() && len != HashKind::Sha256.hex_len() {
            return None;
        }
        if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(ObjectId(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> HashKind {
        if self.0.len() == HashKind::Sha1.hex_len() {
            HashKind::Sha1
        } else {
            HashKind::Sha256
        }
    }

    pub fn zero(kind: HashKind) -> Self {
        ObjectId("0".repeat(kind.hex_len()))
    }

    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
