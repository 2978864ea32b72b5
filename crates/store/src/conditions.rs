//! Precondition and lease evaluation shared by the store implementations.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use lakeflow_protocol::constants::ETAG_WILDCARD;
use lakeflow_protocol::{ObjectInfo, ObjectProperties, Preconditions, RemoteError};
use serde::{Deserialize, Serialize};

/// Committed state of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_length: u64,
    pub content_md5: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
}

impl ObjectMeta {
    /// Metadata of a freshly created, empty object.
    pub fn empty(lease_id: Option<String>) -> Self {
        Self {
            etag: next_etag(),
            last_modified: Utc::now(),
            content_length: 0,
            content_md5: lakeflow_transfer::content_md5(&[]),
            lease_id,
        }
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            content_length: self.content_length,
        }
    }

    pub fn properties(&self) -> ObjectProperties {
        ObjectProperties {
            content_length: self.content_length,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            content_md5: Some(self.content_md5.clone()),
        }
    }
}

static ETAG_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns a new opaque etag, unique within the process.
pub fn next_etag() -> String {
    let seq = ETAG_SEQ.fetch_add(1, Ordering::Relaxed);
    let micros = Utc::now().timestamp_micros();
    format!("\"0x{micros:X}{seq:04X}\"")
}

/// Evaluates conditional headers against the current object, if any.
pub fn evaluate(current: Option<&ObjectMeta>, conditions: &Preconditions) -> Result<(), RemoteError> {
    if let Some(expected) = &conditions.if_match {
        match current {
            None => {
                return Err(RemoteError::precondition_failed(format!(
                    "if-match {expected}: object does not exist"
                )));
            }
            Some(meta) if expected != ETAG_WILDCARD && *expected != meta.etag => {
                return Err(RemoteError::precondition_failed(format!(
                    "if-match {expected}: current etag is {}",
                    meta.etag
                )));
            }
            Some(_) => {}
        }
    }

    if let Some(unwanted) = &conditions.if_none_match
        && let Some(meta) = current
        && (unwanted == ETAG_WILDCARD || *unwanted == meta.etag)
    {
        return Err(RemoteError::precondition_failed(format!(
            "if-none-match {unwanted}: object exists with etag {}",
            meta.etag
        )));
    }

    if let Some(meta) = current {
        if let Some(since) = conditions.if_modified_since
            && meta.last_modified <= since
        {
            return Err(RemoteError::precondition_failed(format!(
                "not modified since {since}"
            )));
        }
        if let Some(since) = conditions.if_unmodified_since
            && meta.last_modified > since
        {
            return Err(RemoteError::precondition_failed(format!(
                "modified after {since}"
            )));
        }
    }

    Ok(())
}

/// A leased object only accepts writes carrying its lease id.
pub fn check_lease(meta: &ObjectMeta, lease_id: Option<&str>) -> Result<(), RemoteError> {
    match (&meta.lease_id, lease_id) {
        (None, _) => Ok(()),
        (Some(held), Some(given)) if held == given => Ok(()),
        (Some(_), Some(given)) => Err(RemoteError::precondition_failed(format!(
            "lease {given} does not match the active lease"
        ))),
        (Some(_), None) => Err(RemoteError::precondition_failed(
            "object is leased and no lease id was given",
        )),
    }
}
