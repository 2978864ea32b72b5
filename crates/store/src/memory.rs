//! In-memory `PathStore`.
//!
//! Keeps committed bytes and uncommitted appends per path, with the same
//! visibility rules as the real service: appended data is invisible to
//! reads until a commit covers it. Fault hooks let tests break appends and
//! reads at chosen points.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use lakeflow_protocol::constants::PROGRESS_SLICE_SIZE;
use lakeflow_protocol::{ContentRange, ObjectInfo, Preconditions, RemoteError, TransferRange};
use lakeflow_transfer::{
    ByteStream, CommitOptions, PathStore, ReadResponse, StoreFuture, collect_stream, content_md5,
};
use tracing::{debug, trace};

use crate::conditions::{ObjectMeta, check_lease, evaluate, next_etag};
use crate::path::validate_object_path;

struct StoredObject {
    meta: ObjectMeta,
    committed: Bytes,
    /// Appended, not yet committed, keyed by absolute offset.
    uncommitted: BTreeMap<u64, Bytes>,
}

#[derive(Default)]
struct Faults {
    append_offsets: HashSet<u64>,
    /// Each entry breaks one read response after that many bytes.
    read_breaks: VecDeque<u64>,
}

/// Thread-safe in-memory object store.
pub struct MemoryPathStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    read_chunk_size: usize,
}

impl Default for MemoryPathStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPathStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            read_chunk_size: PROGRESS_SLICE_SIZE,
        }
    }

    /// Sets the size of the chunks read bodies are split into.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Makes every append starting at `offset` fail with a transient error.
    pub fn fail_appends_at(&self, offset: u64) {
        self.faults().append_offsets.insert(offset);
    }

    /// Breaks the next read response after `after` bytes with a transient
    /// error. Calls queue up, one per response.
    pub fn break_next_read_after(&self, after: u64) {
        self.faults().read_breaks.push_back(after);
    }

    /// Committed bytes of `path`.
    pub fn committed(&self, path: &str) -> Option<Bytes> {
        self.objects().get(path).map(|o| o.committed.clone())
    }

    /// Bytes appended to `path` but not yet committed.
    pub fn uncommitted_len(&self, path: &str) -> u64 {
        self.objects().get(path).map_or(0, |o| {
            o.uncommitted.values().map(|b| b.len() as u64).sum()
        })
    }

    pub fn meta(&self, path: &str) -> Option<ObjectMeta> {
        self.objects().get(path).map(|o| o.meta.clone())
    }

    /// Replaces `path` with committed `data`, as an out-of-band writer would.
    pub fn put(&self, path: &str, data: &[u8]) -> ObjectInfo {
        let meta = ObjectMeta {
            etag: next_etag(),
            last_modified: Utc::now(),
            content_length: data.len() as u64,
            content_md5: content_md5(data),
            lease_id: None,
        };
        let info = meta.info();
        self.objects().insert(
            path.to_string(),
            StoredObject {
                meta,
                committed: Bytes::copy_from_slice(data),
                uncommitted: BTreeMap::new(),
            },
        );
        info
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn do_create(&self, path: &str, conditions: &Preconditions) -> Result<ObjectInfo, RemoteError> {
        validate_object_path(path)?;
        let mut objects = self.objects();
        evaluate(objects.get(path).map(|o| &o.meta), conditions)?;

        let meta = ObjectMeta::empty(conditions.lease_id.clone());
        let info = meta.info();
        objects.insert(
            path.to_string(),
            StoredObject {
                meta,
                committed: Bytes::new(),
                uncommitted: BTreeMap::new(),
            },
        );
        debug!(path, etag = %info.etag, "created");
        Ok(info)
    }

    fn do_append(
        &self,
        path: &str,
        range: TransferRange,
        body: Bytes,
        lease_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        if self.faults().append_offsets.contains(&range.offset) {
            return Err(RemoteError::transient(format!("injected append failure at {range}")));
        }
        if body.len() as u64 != range.length {
            return Err(RemoteError::invalid_range(format!(
                "append {range} carried {} bytes",
                body.len()
            )));
        }

        let mut objects = self.objects();
        let object = objects
            .get_mut(path)
            .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
        check_lease(&object.meta, lease_id)?;
        if range.offset < object.meta.content_length {
            return Err(RemoteError::invalid_range(format!(
                "append {range} overlaps committed data ending at {}",
                object.meta.content_length
            )));
        }
        object.uncommitted.insert(range.offset, body);
        trace!(path, %range, "appended");
        Ok(())
    }

    fn do_commit(
        &self,
        path: &str,
        final_length: u64,
        options: &CommitOptions,
    ) -> Result<ObjectInfo, RemoteError> {
        let mut objects = self.objects();
        let object = objects
            .get_mut(path)
            .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
        evaluate(Some(&object.meta), &options.preconditions)?;
        check_lease(&object.meta, options.preconditions.lease_id.as_deref())?;

        let committed_len = object.meta.content_length;
        if final_length < committed_len {
            return Err(RemoteError::invalid_range(format!(
                "commit at {final_length} is below the committed length {committed_len}"
            )));
        }

        let mut assembled = BytesMut::from(&object.committed[..]);
        let mut leftover = BTreeMap::new();
        let mut cursor = committed_len;
        for (&offset, data) in &object.uncommitted {
            let end = offset + data.len() as u64;
            if cursor >= final_length || offset >= final_length {
                leftover.insert(offset, data.clone());
                continue;
            }
            if offset != cursor {
                return Err(RemoteError::invalid_range(format!(
                    "commit at {final_length}: no data at offset {cursor}"
                )));
            }
            let take = (final_length.min(end) - offset) as usize;
            assembled.extend_from_slice(&data[..take]);
            if take < data.len() {
                leftover.insert(final_length, data.slice(take..));
            }
            cursor = offset + take as u64;
        }
        if cursor != final_length {
            return Err(RemoteError::invalid_range(format!(
                "commit at {final_length}: data ends at {cursor}"
            )));
        }

        let committed = assembled.freeze();
        object.meta = ObjectMeta {
            etag: next_etag(),
            last_modified: Utc::now(),
            content_length: final_length,
            content_md5: content_md5(&committed),
            lease_id: if options.close {
                None
            } else {
                object.meta.lease_id.clone()
            },
        };
        object.committed = committed;
        object.uncommitted = if options.retain_uncommitted {
            leftover
        } else {
            BTreeMap::new()
        };
        debug!(path, final_length, etag = %object.meta.etag, "committed");
        Ok(object.meta.info())
    }

    fn do_read(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
        conditions: &Preconditions,
    ) -> Result<ReadResponse, RemoteError> {
        let (meta, data) = {
            let objects = self.objects();
            let object = objects
                .get(path)
                .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
            evaluate(Some(&object.meta), conditions)?;
            (object.meta.clone(), object.committed.clone())
        };

        let total = meta.content_length;
        if offset > total || (offset == total && total > 0) {
            return Err(RemoteError::invalid_range(format!(
                "offset {offset} is outside a {total} byte object"
            )));
        }
        let end = length.map_or(total, |len| offset.saturating_add(len).min(total));
        let body = data.slice(offset as usize..end as usize);

        let mut items: Vec<Result<Bytes, RemoteError>> = Vec::new();
        let mut rest = body;
        let break_after = self.faults().read_breaks.pop_front();
        let mut budget = break_after.unwrap_or(u64::MAX);
        while !rest.is_empty() && budget > 0 {
            let n = rest.len().min(self.read_chunk_size).min(budget.min(usize::MAX as u64) as usize);
            items.push(Ok(rest.split_to(n)));
            budget -= n as u64;
        }
        if break_after.is_some() {
            items.push(Err(RemoteError::transient("injected read failure")));
        }

        let content_range = (end > offset).then(|| {
            ContentRange::for_range(
                TransferRange {
                    offset,
                    length: end - offset,
                },
                total,
            )
        });
        Ok(ReadResponse {
            properties: meta.properties(),
            content_range,
            body: Box::pin(futures_util::stream::iter(items)),
        })
    }
}

impl PathStore for MemoryPathStore {
    fn create<'a>(
        &'a self,
        path: &'a str,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(async move { self.do_create(path, preconditions) })
    }

    fn append<'a>(
        &'a self,
        path: &'a str,
        range: TransferRange,
        data: ByteStream,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let body = collect_stream(data).await?;
            self.do_append(path, range, body, lease_id)
        })
    }

    fn commit<'a>(
        &'a self,
        path: &'a str,
        final_length: u64,
        options: &'a CommitOptions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(async move { self.do_commit(path, final_length, options) })
    }

    fn read_range<'a>(
        &'a self,
        path: &'a str,
        offset: u64,
        length: Option<u64>,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ReadResponse> {
        Box::pin(async move { self.do_read(path, offset, length, preconditions) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeflow_transfer::once_stream;
    use futures_util::StreamExt;

    fn range(offset: u64, length: u64) -> TransferRange {
        TransferRange { offset, length }
    }

    async fn append(store: &MemoryPathStore, path: &str, offset: u64, data: &'static [u8]) {
        store
            .append(
                path,
                range(offset, data.len() as u64),
                once_stream(Bytes::from_static(data)),
                None,
            )
            .await
            .unwrap();
    }

    fn close() -> CommitOptions {
        CommitOptions {
            close: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn appends_are_invisible_until_commit() {
        let store = MemoryPathStore::new();
        store.create("a", &Preconditions::default()).await.unwrap();
        append(&store, "a", 5, b"world").await;
        append(&store, "a", 0, b"hello").await;

        assert_eq!(store.committed("a").unwrap(), Bytes::new());
        assert_eq!(store.uncommitted_len("a"), 10);

        let info = store.commit("a", 10, &close()).await.unwrap();
        assert_eq!(info.content_length, 10);
        assert_eq!(store.committed("a").unwrap(), &b"helloworld"[..]);
        assert_eq!(store.uncommitted_len("a"), 0);
    }

    #[tokio::test]
    async fn commit_with_gap_fails() {
        let store = MemoryPathStore::new();
        store.create("a", &Preconditions::default()).await.unwrap();
        append(&store, "a", 0, b"abc").await;
        append(&store, "a", 5, b"fgh").await;

        let err = store.commit("a", 8, &close()).await.unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn partial_commit_can_retain_the_rest() {
        let store = MemoryPathStore::new();
        store.create("a", &Preconditions::default()).await.unwrap();
        append(&store, "a", 0, b"abcdef").await;

        let retain = CommitOptions {
            retain_uncommitted: true,
            ..Default::default()
        };
        store.commit("a", 4, &retain).await.unwrap();
        assert_eq!(store.committed("a").unwrap(), &b"abcd"[..]);
        assert_eq!(store.uncommitted_len("a"), 2);

        store.commit("a", 6, &close()).await.unwrap();
        assert_eq!(store.committed("a").unwrap(), &b"abcdef"[..]);
    }

    #[tokio::test]
    async fn create_honours_no_overwrite() {
        let store = MemoryPathStore::new();
        store.put("a", b"old");
        let err = store
            .create("a", &Preconditions::no_overwrite())
            .await
            .unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::PreconditionFailed);
        assert_eq!(store.committed("a").unwrap(), &b"old"[..]);
    }

    #[tokio::test]
    async fn append_requires_existing_path_and_lease() {
        let store = MemoryPathStore::new();
        let err = store
            .append("nope", range(0, 1), once_stream(Bytes::from_static(b"x")), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::NotFound);

        store
            .create("leased", &Preconditions::default().with_lease(Some("L".into())))
            .await
            .unwrap();
        let err = store
            .append("leased", range(0, 1), once_stream(Bytes::from_static(b"x")), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::PreconditionFailed);
        store
            .append("leased", range(0, 1), once_stream(Bytes::from_static(b"x")), Some("L"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_range_serves_committed_data() {
        let store = MemoryPathStore::new().with_read_chunk_size(3);
        store.put("r", b"0123456789");

        let resp = store
            .read_range("r", 2, Some(5), &Preconditions::default())
            .await
            .unwrap();
        assert_eq!(resp.content_range.unwrap().to_string(), "bytes 2-6/10");
        assert_eq!(resp.properties.content_length, 10);
        let body = collect_stream(resp.body).await.unwrap();
        assert_eq!(body, &b"23456"[..]);

        let err = store
            .read_range("r", 11, None, &Preconditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::InvalidRange);
    }

    #[tokio::test]
    async fn injected_read_break() {
        let store = MemoryPathStore::new().with_read_chunk_size(4);
        store.put("r", b"0123456789");
        store.break_next_read_after(6);

        let resp = store
            .read_range("r", 0, None, &Preconditions::default())
            .await
            .unwrap();
        let items: Vec<_> = resp.body.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &b"0123"[..]);
        assert_eq!(items[1].as_ref().unwrap(), &b"45"[..]);
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn read_checks_if_match() {
        let store = MemoryPathStore::new();
        let info = store.put("r", b"abc");
        assert!(
            store
                .read_range("r", 0, None, &Preconditions::if_match(info.etag))
                .await
                .is_ok()
        );
        store.put("r", b"xyz");
        let err = store
            .read_range("r", 0, None, &Preconditions::if_match("\"stale\""))
            .await
            .unwrap_err();
        assert_eq!(err.kind, lakeflow_protocol::RemoteErrorKind::PreconditionFailed);
    }
}
