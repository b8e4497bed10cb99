//! Short, human-typable share codes.
//!
//! Codes are drawn from an alphabet without look-alike characters (no `0`/`O`,
//! no `1`/`I`/`L`) and compared case-insensitively. The code length is the
//! smallest length that keeps the probability of a random collision among the
//! expected number of live codes under a configured threshold.

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Characters a share code may contain.
pub const ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Shortest code ever issued.
pub const MIN_CODE_LENGTH: usize = 6;

/// Longest code accepted on lookup.
pub const MAX_CODE_LENGTH: usize = 32;

/// A normalized (uppercase) share code.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShareCode(String);

impl ShareCode {
    /// Normalize user input: trims, uppercases, and checks the alphabet.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        if normalized.len() < MIN_CODE_LENGTH || normalized.len() > MAX_CODE_LENGTH {
            return Err(crate::Error::BadInput(format!(
                "share code must be {MIN_CODE_LENGTH}-{MAX_CODE_LENGTH} characters"
            )));
        }
        if let Some(bad) = normalized.bytes().find(|b| !ALPHABET.contains(b)) {
            return Err(crate::Error::BadInput(format!(
                "share code contains invalid character {:?}",
                bad as char
            )));
        }
        Ok(Self(normalized))
    }

    /// Draw a random code of `len` characters.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Self {
        let code = (0..len)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareCode({})", self.0)
    }
}

impl fmt::Display for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ShareCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ShareCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Sizing and collision policy for share codes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CodePolicy {
    pub min_length: usize,
    /// Expected peak number of simultaneously active codes.
    pub peak_active_codes: u64,
    /// Acceptable probability that a fresh random code collides.
    pub collision_threshold: f64,
    /// Collisions tolerated at one length before growing the code.
    pub max_collisions: u32,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_CODE_LENGTH,
            peak_active_codes: 100,
            collision_threshold: 1e-6,
            max_collisions: 8,
        }
    }
}

impl CodePolicy {
    /// Smallest length `L >= min_length` with
    /// `|ALPHABET|^L > max(2 * peak, peak / threshold)`.
    pub fn initial_length(&self) -> usize {
        let peak = self.peak_active_codes.max(1) as f64;
        let threshold = if self.collision_threshold > 0.0 {
            self.collision_threshold
        } else {
            f64::MIN_POSITIVE
        };
        let target = (2.0 * peak).max(peak / threshold);
        let base = ALPHABET.len() as f64;

        let mut len = self.min_length.max(MIN_CODE_LENGTH);
        while len < MAX_CODE_LENGTH && base.powi(len as i32) <= target {
            len += 1;
        }
        len
    }
}
