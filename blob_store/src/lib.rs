//! Primary object store used by the gateway.
//!
//! The gateway only talks to the store through [`PrimaryStore`] and
//! [`MultipartSession`]; [`ObjectStorePrimary`] implements both on top of
//! `object_store`.

use std::{collections::BTreeMap, fmt, ops::Range};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gateway_utils::ByteStream;
use serde::{Deserialize, Serialize};

mod object;

pub use object::ObjectStorePrimary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Store URL, e.g. `s3://bucket/prefix` or `memory:///`.
    pub path: String,
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            path: "memory:///".to_string(),
        }
    }
}

/// A byte range requested by a client or issued internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// The whole object.
    Whole,
    /// `length` bytes starting at `offset`; `None` reads to the end.
    OffsetLength { offset: u64, length: Option<u64> },
    /// The last `n` bytes.
    Suffix { n: u64 },
}

impl RangeSpec {
    pub fn is_ranged(&self) -> bool {
        !matches!(self, RangeSpec::Whole)
    }

    pub fn starts_at_zero(&self) -> bool {
        matches!(self, RangeSpec::OffsetLength { offset: 0, .. })
    }

    /// Inclusive `(first, last)` byte positions this range selects in an
    /// object of `size` bytes, or `None` for the whole object and for ranges
    /// that select nothing.
    pub fn bounds(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        match *self {
            RangeSpec::Whole => None,
            RangeSpec::Suffix { n } => Some((size.saturating_sub(n), size - 1)),
            RangeSpec::OffsetLength { offset, length } => {
                let last = match length {
                    Some(0) => return None,
                    Some(length) => offset.saturating_add(length - 1).min(size - 1),
                    None => size - 1,
                };
                (offset <= last).then_some((offset, last))
            }
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Whole => write!(f, "whole"),
            RangeSpec::OffsetLength {
                offset,
                length: Some(length),
            } => write!(f, "bytes={}-{}", offset, offset + length.saturating_sub(1)),
            RangeSpec::OffsetLength {
                offset,
                length: None,
            } => write!(f, "bytes={}-", offset),
            RangeSpec::Suffix { n } => write!(f, "bytes=-{}", n),
        }
    }
}

/// Conditional-request headers forwarded to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

/// What a conditional request resolves to against an object's validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

impl Conditions {
    pub fn is_empty(&self) -> bool {
        *self == Conditions::default()
    }

    /// Evaluates the conditions in the order HTTP prescribes: `if-match`,
    /// else `if-unmodified-since`, then `if-none-match`, else
    /// `if-modified-since`. Dates compare at whole-second precision.
    pub fn evaluate(
        &self,
        etag: Option<&str>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Precondition {
        let modified = last_modified.map(|t| t.timestamp());
        if let Some(candidates) = &self.if_match {
            if !etag.is_some_and(|etag| etag_listed(candidates, etag, true)) {
                return Precondition::Failed;
            }
        } else if let (Some(since), Some(modified)) = (self.if_unmodified_since, modified) {
            if modified > since.timestamp() {
                return Precondition::Failed;
            }
        }
        if let Some(candidates) = &self.if_none_match {
            if etag.is_some_and(|etag| etag_listed(candidates, etag, false)) {
                return Precondition::NotModified;
            }
        } else if let (Some(since), Some(modified)) = (self.if_modified_since, modified) {
            if modified <= since.timestamp() {
                return Precondition::NotModified;
            }
        }
        Precondition::Proceed
    }
}

/// Whether `etag` appears in a comma-separated entity-tag list. Weak
/// comparison ignores `W/`; strong comparison never matches a weak tag.
pub fn etag_listed(list: &str, etag: &str, strong: bool) -> bool {
    fn opaque(tag: &str) -> (&str, bool) {
        match tag.strip_prefix("W/") {
            Some(tag) => (tag, true),
            None => (tag, false),
        }
    }
    let (etag, etag_weak) = opaque(etag.trim());
    list.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let (candidate, weak) = opaque(candidate);
        candidate == etag && !(strong && (weak || etag_weak))
    })
}

/// Snapshot of an object's metadata as reported by the primary store or the
/// origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredObjectMetadata {
    pub etag: Option<String>,
    pub size: u64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Extra entity headers persisted with the object, keyed by lowercase
    /// header name.
    pub custom_headers: BTreeMap<String, String>,
}

pub struct StoredObject {
    pub metadata: StoredObjectMetadata,
    /// The byte range actually returned, when a range was requested.
    pub range: Option<Range<u64>>,
    pub body: ByteStream,
}

pub enum StoreRead {
    Found(StoredObject),
    NotModified(StoredObjectMetadata),
    PreconditionFailed(StoredObjectMetadata),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub part_number: u32,
    pub etag: String,
}

/// An open multipart upload. Parts may be uploaded concurrently and in any
/// order; `complete` takes them ordered by part number.
#[async_trait]
pub trait MultipartSession: Send + Sync {
    async fn upload_part(&self, part_number: u32, body: Bytes) -> Result<PartResult>;

    async fn complete(&self, parts: Vec<PartResult>) -> Result<()>;

    async fn abort(&self) -> Result<()>;
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn head(&self, key: &str) -> Result<Option<StoredObjectMetadata>>;

    async fn get(&self, key: &str, range: &RangeSpec, conditions: &Conditions)
        -> Result<StoreRead>;

    async fn put(&self, key: &str, body: Bytes, metadata: &StoredObjectMetadata) -> Result<()>;

    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: &StoredObjectMetadata,
    ) -> Result<Box<dyn MultipartSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let size = 100;
        assert_eq!(RangeSpec::Whole.bounds(size), None);
        assert_eq!(RangeSpec::Suffix { n: 10 }.bounds(size), Some((90, 99)));
        assert_eq!(RangeSpec::Suffix { n: 500 }.bounds(size), Some((0, 99)));
        assert_eq!(
            RangeSpec::OffsetLength {
                offset: 0,
                length: Some(1024)
            }
            .bounds(size),
            Some((0, 99))
        );
        assert_eq!(
            RangeSpec::OffsetLength {
                offset: 10,
                length: Some(5)
            }
            .bounds(size),
            Some((10, 14))
        );
        assert_eq!(
            RangeSpec::OffsetLength {
                offset: 40,
                length: None
            }
            .bounds(size),
            Some((40, 99))
        );
        assert_eq!(
            RangeSpec::OffsetLength {
                offset: 100,
                length: None
            }
            .bounds(size),
            None
        );
        assert_eq!(RangeSpec::Suffix { n: 1 }.bounds(0), None);
    }

    #[test]
    fn test_etag_listed() {
        assert!(etag_listed("\"abc\"", "\"abc\"", true));
        assert!(etag_listed("W/\"abc\"", "\"abc\"", false));
        assert!(!etag_listed("W/\"abc\"", "\"abc\"", true));
        assert!(etag_listed("\"x\", \"abc\"", "\"abc\"", false));
        assert!(etag_listed("*", "\"abc\"", true));
        assert!(!etag_listed("\"abd\"", "\"abc\"", false));
    }

    #[test]
    fn test_evaluate_conditions() {
        let modified = DateTime::parse_from_rfc3339("2015-10-21T07:28:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let at = |rfc3339: &str| {
            Some(
                DateTime::parse_from_rfc3339(rfc3339)
                    .unwrap()
                    .with_timezone(&Utc),
            )
        };
        let etag = Some("\"v1\"");

        assert_eq!(
            Conditions::default().evaluate(etag, Some(modified)),
            Precondition::Proceed
        );
        let none_match = Conditions {
            if_none_match: Some("\"v1\"".to_string()),
            ..Default::default()
        };
        assert_eq!(none_match.evaluate(etag, Some(modified)), Precondition::NotModified);
        assert_eq!(
            none_match.evaluate(Some("\"v2\""), Some(modified)),
            Precondition::Proceed
        );

        let if_match = Conditions {
            if_match: Some("\"other\"".to_string()),
            if_none_match: Some("\"v1\"".to_string()),
            ..Default::default()
        };
        assert_eq!(if_match.evaluate(etag, Some(modified)), Precondition::Failed);

        let since = Conditions {
            if_modified_since: at("2015-10-21T07:28:00Z"),
            ..Default::default()
        };
        assert_eq!(since.evaluate(etag, Some(modified)), Precondition::NotModified);
        let since = Conditions {
            if_modified_since: at("2015-10-21T07:27:59Z"),
            ..Default::default()
        };
        assert_eq!(since.evaluate(etag, Some(modified)), Precondition::Proceed);

        let unmodified = Conditions {
            if_unmodified_since: at("2015-10-20T00:00:00Z"),
            ..Default::default()
        };
        assert_eq!(unmodified.evaluate(etag, Some(modified)), Precondition::Failed);
        assert!(!unmodified.is_empty());
        assert!(Conditions::default().is_empty());
    }

    #[test]
    fn test_starts_at_zero() {
        assert!(RangeSpec::OffsetLength {
            offset: 0,
            length: Some(1024)
        }
        .starts_at_zero());
        assert!(!RangeSpec::OffsetLength {
            offset: 1024,
            length: Some(1024)
        }
        .starts_at_zero());
        assert!(!RangeSpec::Suffix { n: 10 }.starts_at_zero());
        assert!(!RangeSpec::Whole.starts_at_zero());
    }
}
