//! Byte ranges for resumable downloads.

use crate::{Error, Result};

/// A half-open byte range `[start, end)` within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The whole file.
    pub fn full(total_size: u64) -> Self {
        Self {
            start: 0,
            end: total_size,
        }
    }

    /// Clamp `[start, end)` to `[0, total_size)`.
    ///
    /// Fails if nothing of the range lies within the file.
    pub fn clamped(start: u64, end: u64, total_size: u64) -> Result<Self> {
        let end = end.min(total_size);
        if start >= end {
            return Err(Error::BadInput(format!(
                "range {start}-{end} is not satisfiable for a {total_size} byte file"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self, total_size: u64) -> bool {
        self.start == 0 && self.end == total_size
    }

    /// `Content-Range` header value (`bytes first-last/total`, inclusive).
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, total_size)
    }

    /// Parse a `Range` header.
    ///
    /// Accepted forms are `bytes=A-B` (half-open, `B` excluded), `bytes=A-`
    /// (to end of file) and `bytes=-N` (final `N` bytes). Multiple ranges are
    /// not supported.
    pub fn parse_header(value: &str, total_size: u64) -> Result<Self> {
        let spec = value
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::BadInput(format!("unsupported range unit: {value:?}")))?;
        if spec.contains(',') {
            return Err(Error::BadInput("multiple ranges are not supported".into()));
        }
        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| Error::BadInput(format!("malformed range: {value:?}")))?;
        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| Error::BadInput(format!("malformed range: {value:?}")))
        };

        match (first.trim().is_empty(), last.trim().is_empty()) {
            (false, false) => Self::clamped(number(first)?, number(last)?, total_size),
            (false, true) => Self::clamped(number(first)?, total_size, total_size),
            (true, false) => {
                let suffix = number(last)?;
                Self::clamped(total_size.saturating_sub(suffix), total_size, total_size)
            }
            (true, true) => Err(Error::BadInput(format!("malformed range: {value:?}"))),
        }
    }
}
