//! In-memory store double shared by the orchestration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lakeflow_protocol::{
    ContentRange, ObjectInfo, ObjectProperties, Preconditions, RemoteError, TransferRange,
};
use rand::Rng;

use crate::chunked::content_md5;
use crate::store::{ByteStream, CommitOptions, PathStore, ReadResponse, StoreFuture, collect_stream};

#[derive(Default)]
struct Object {
    committed: Bytes,
    staged: BTreeMap<u64, Bytes>,
    version: u64,
}

impl Object {
    fn etag(&self) -> String {
        format!("\"v{}\"", self.version)
    }
}

/// Store double with scripted append failures and random append latency.
#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<String, Object>>,
    fail_offsets: Mutex<HashSet<u64>>,
    max_delay_ms: u64,
    read_chunk: usize,
    pub appends: Mutex<Vec<TransferRange>>,
    pub commits: Mutex<Vec<u64>>,
    pub creates: Mutex<Vec<Preconditions>>,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            read_chunk: 7,
            ..Default::default()
        }
    }

    /// Appends sleep for a random time up to `max_ms`.
    pub fn with_jitter(mut self, max_ms: u64) -> Self {
        self.max_delay_ms = max_ms;
        self
    }

    /// Appends at `offset` fail with a transient error.
    pub fn fail_append_at(self, offset: u64) -> Self {
        self.fail_offsets.lock().unwrap().insert(offset);
        self
    }

    /// Seeds a committed object.
    pub fn with_object(self, path: &str, data: &[u8]) -> Self {
        self.objects.lock().unwrap().insert(
            path.to_string(),
            Object {
                committed: Bytes::copy_from_slice(data),
                staged: BTreeMap::new(),
                version: 1,
            },
        );
        self
    }

    pub fn committed(&self, path: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .map(|o| o.committed.clone())
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().unwrap().len()
    }

    pub fn append_count(&self) -> usize {
        self.appends.lock().unwrap().len()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl PathStore for MockStore {
    fn create<'a>(
        &'a self,
        path: &'a str,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(async move {
            self.creates.lock().unwrap().push(preconditions.clone());
            let mut objects = self.objects.lock().unwrap();
            if preconditions.if_none_match.as_deref() == Some("*") && objects.contains_key(path) {
                return Err(RemoteError::precondition_failed("path already exists"));
            }
            let version = objects.get(path).map_or(1, |o| o.version + 1);
            let object = Object {
                version,
                ..Default::default()
            };
            let info = ObjectInfo {
                etag: object.etag(),
                last_modified: chrono::Utc::now(),
                content_length: 0,
            };
            objects.insert(path.to_string(), object);
            Ok(info)
        })
    }

    fn append<'a>(
        &'a self,
        path: &'a str,
        range: TransferRange,
        data: ByteStream,
        _lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.appends.lock().unwrap().push(range);

            if self.max_delay_ms > 0 {
                let ms = rand::thread_rng().gen_range(0..=self.max_delay_ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let body = collect_stream(data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let body = body?;

            if self.fail_offsets.lock().unwrap().contains(&range.offset) {
                return Err(RemoteError::transient(format!("append {range} reset")));
            }
            if body.len() as u64 != range.length {
                return Err(RemoteError::invalid_range("body length mismatch"));
            }
            let mut objects = self.objects.lock().unwrap();
            let object = objects
                .get_mut(path)
                .ok_or_else(|| RemoteError::not_found(path))?;
            object.staged.insert(range.offset, body);
            Ok(())
        })
    }

    fn commit<'a>(
        &'a self,
        path: &'a str,
        final_length: u64,
        _options: &'a CommitOptions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(async move {
            self.commits.lock().unwrap().push(final_length);
            let mut objects = self.objects.lock().unwrap();
            let object = objects
                .get_mut(path)
                .ok_or_else(|| RemoteError::not_found(path))?;

            let mut assembled = Vec::with_capacity(final_length as usize);
            for (offset, data) in &object.staged {
                if *offset != assembled.len() as u64 {
                    return Err(RemoteError::invalid_range("gap in appended data"));
                }
                assembled.extend_from_slice(data);
            }
            if assembled.len() as u64 != final_length {
                return Err(RemoteError::invalid_range("commit length mismatch"));
            }
            object.committed = Bytes::from(assembled);
            object.staged.clear();
            object.version += 1;
            Ok(ObjectInfo {
                etag: object.etag(),
                last_modified: chrono::Utc::now(),
                content_length: final_length,
            })
        })
    }

    fn read_range<'a>(
        &'a self,
        path: &'a str,
        offset: u64,
        length: Option<u64>,
        _preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ReadResponse> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (data, etag) = {
                let objects = self.objects.lock().unwrap();
                let object = objects
                    .get(path)
                    .ok_or_else(|| RemoteError::not_found(path))?;
                (object.committed.clone(), object.etag())
            };
            let total = data.len() as u64;
            if offset > total || (offset == total && total > 0) {
                return Err(RemoteError::invalid_range("offset past end"));
            }
            let end = length.map_or(total, |l| (offset + l).min(total));
            let body = data.slice(offset as usize..end as usize);
            let chunks: Vec<Result<Bytes, RemoteError>> = body
                .chunks(self.read_chunk.max(1))
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(ReadResponse {
                properties: ObjectProperties {
                    content_length: total,
                    etag,
                    last_modified: chrono::Utc::now(),
                    content_md5: Some(content_md5(&data)),
                },
                content_range: (end > offset).then(|| {
                    ContentRange::for_range(
                        TransferRange {
                            offset,
                            length: end - offset,
                        },
                        total,
                    )
                }),
                body: Box::pin(futures_util::stream::iter(chunks)),
            })
        })
    }
}
