use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::ETAG_WILDCARD;

/// Error produced when building or parsing a byte range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("range length must be greater than zero")]
    Empty,

    #[error("range {offset}+{length} overflows u64")]
    Overflow { offset: u64, length: u64 },

    #[error("malformed content range: {0}")]
    Malformed(String),
}

/// A half-open byte range `[offset, offset + length)` within one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferRange {
    pub offset: u64,
    pub length: u64,
}

impl TransferRange {
    /// Creates a range, rejecting empty and overflowing ones.
    pub fn new(offset: u64, length: u64) -> Result<Self, RangeError> {
        if length == 0 {
            return Err(RangeError::Empty);
        }
        if offset.checked_add(length).is_none() {
            return Err(RangeError::Overflow { offset, length });
        }
        Ok(Self { offset, length })
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

impl fmt::Display for TransferRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Parsed `Content-Range` value: `bytes <first>-<last>/<total|*>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRange {
    /// First byte position (inclusive).
    pub first: u64,
    /// Last byte position (inclusive).
    pub last: u64,
    /// Full object size, when the server reported it.
    pub total: Option<u64>,
}

impl ContentRange {
    /// Builds the content range a server returns for `range` of an object of `total` bytes.
    pub fn for_range(range: TransferRange, total: u64) -> Self {
        Self {
            first: range.offset,
            last: range.end() - 1,
            total: Some(total),
        }
    }

    pub fn length(&self) -> u64 {
        self.last - self.first + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.first, self.last, total),
            None => write!(f, "bytes {}-{}/*", self.first, self.last),
        }
    }
}

impl FromStr for ContentRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RangeError::Malformed(s.to_string());

        let rest = s.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
        let (span, total) = rest.split_once('/').ok_or_else(malformed)?;
        let (first, last) = span.split_once('-').ok_or_else(malformed)?;

        let first: u64 = first.trim().parse().map_err(|_| malformed())?;
        let last: u64 = last.trim().parse().map_err(|_| malformed())?;
        if last < first {
            return Err(malformed());
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().map_err(|_| malformed())?),
        };
        if let Some(total) = total
            && last >= total
        {
            return Err(malformed());
        }

        Ok(Self { first, last, total })
    }
}

/// Conditional request headers, passed through to the store opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_modified_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_unmodified_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
}

impl Preconditions {
    /// Succeeds only if the target does not exist yet.
    pub fn no_overwrite() -> Self {
        Self {
            if_none_match: Some(ETAG_WILDCARD.to_string()),
            ..Default::default()
        }
    }

    /// Succeeds only while the target still carries `etag`.
    pub fn if_match(etag: impl Into<String>) -> Self {
        Self {
            if_match: Some(etag.into()),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease_id: Option<String>) -> Self {
        self.lease_id = lease_id;
        self
    }

    /// Returns `true` if no condition is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of a create or commit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    /// Committed length after the call.
    pub content_length: u64,
}

/// Properties returned alongside a ranged read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectProperties {
    /// Full committed length of the object (not of the range).
    pub content_length: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    /// MD5 of the whole object, when the store keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
}
