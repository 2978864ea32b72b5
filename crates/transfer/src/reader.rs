//! Resilient ranged reader.
//!
//! States: `Idle -> Requesting -> Streaming -> {Done | Retrying -> Requesting | Failed}`.
//! A stream that breaks after delivering bytes is re-requested from the
//! last delivered offset, never from the original start, so the caller
//! sees every byte exactly once and in order.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use lakeflow_protocol::{ObjectProperties, Preconditions, RemoteError, TransferRange};
use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::error::{Operation, TransferError};
use crate::progress::ProgressAccumulator;
use crate::store::{ByteStream, PathStore, ReadResponse};
use crate::types::DownloadCursor;

/// Reader settings resolved from `DownloadOptions`.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Number of resumptions allowed after mid-stream transport failures.
    pub retry_budget: u32,
    pub verify_hash: bool,
    pub preconditions: Preconditions,
}

enum ReadState {
    Idle,
    Streaming(ByteStream),
    Retrying,
    Done,
    Failed,
}

/// Reads a byte range, transparently resuming dropped streams.
pub struct ResilientReader {
    store: Arc<dyn PathStore>,
    path: String,
    options: ReaderOptions,
    cursor: DownloadCursor,
    state: ReadState,
    properties: Option<ObjectProperties>,
    current: Operation,
    retries_used: u32,
    delivered_since_reset: u64,
    read_calls: u32,
    hasher: Option<Md5>,
    progress: Option<Arc<ProgressAccumulator>>,
}

impl ResilientReader {
    /// Creates a reader for `range`, or for the whole object when `None`.
    ///
    /// Fails with `Configuration` for an empty or overflowing range, before
    /// any request is issued.
    pub fn new(
        store: Arc<dyn PathStore>,
        path: &str,
        range: Option<TransferRange>,
        options: ReaderOptions,
    ) -> Result<Self, TransferError> {
        let (offset, length) = match range {
            Some(r) => (r.offset, Some(r.length)),
            None => (0, None),
        };
        Ok(Self {
            store,
            path: path.to_string(),
            options,
            cursor: DownloadCursor::new(offset, length)?,
            state: ReadState::Idle,
            properties: None,
            current: Operation::Read { offset, length },
            retries_used: 0,
            delivered_since_reset: 0,
            read_calls: 0,
            hasher: None,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: Arc<ProgressAccumulator>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Issues the first request if it has not been issued yet.
    pub async fn open(&mut self) -> Result<&ObjectProperties, TransferError> {
        if matches!(self.state, ReadState::Idle) {
            self.request().await?;
        }
        self.properties
            .as_ref()
            .ok_or(TransferError::InvalidState("reader has no response"))
    }

    /// Returns the next chunk in order, or `None` once the range is delivered.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        loop {
            match &mut self.state {
                ReadState::Done => return Ok(None),
                ReadState::Failed => {
                    return Err(TransferError::InvalidState("read already failed"));
                }
                ReadState::Idle | ReadState::Retrying => {
                    if self.cursor.is_complete() {
                        self.finish()?;
                        return Ok(None);
                    }
                    self.request().await?;
                }
                ReadState::Streaming(body) => match body.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => {}
                    Some(Ok(chunk)) => return self.accept(chunk).map(Some),
                    Some(Err(e)) => self.on_failure(e)?,
                    None if self.cursor.is_complete() => {
                        self.finish()?;
                        return Ok(None);
                    }
                    None => {
                        let e = RemoteError::transient(format!(
                            "stream ended at offset {} before {}",
                            self.cursor.last_offset_acked,
                            self.cursor.requested_end.unwrap_or_default()
                        ));
                        self.on_failure(e)?;
                    }
                },
            }
        }
    }

    /// Converts the reader into a stream of in-order chunks.
    ///
    /// The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, TransferError>> + Send {
        futures_util::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Properties from the first response.
    pub fn properties(&self) -> Option<&ObjectProperties> {
        self.properties.as_ref()
    }

    pub fn cursor(&self) -> &DownloadCursor {
        &self.cursor
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Number of `read_range` calls issued so far.
    pub fn read_calls(&self) -> u32 {
        self.read_calls
    }

    async fn request(&mut self) -> Result<(), TransferError> {
        let offset = self.cursor.last_offset_acked;
        let length = self.cursor.remaining();
        self.current = Operation::Read { offset, length };

        let mut preconditions = self.options.preconditions.clone();
        // Pin retries to the version served first.
        if let Some(props) = &self.properties
            && preconditions.if_match.is_none()
        {
            preconditions.if_match = Some(props.etag.clone());
        }

        self.read_calls += 1;
        debug!(
            path = %self.path,
            offset,
            length = ?length,
            attempt = self.read_calls,
            "requesting range"
        );

        match self
            .store
            .read_range(&self.path, offset, length, &preconditions)
            .await
        {
            Ok(response) => self.on_response(response),
            Err(e) => self.on_failure(e),
        }
    }

    fn on_response(&mut self, response: ReadResponse) -> Result<(), TransferError> {
        let ReadResponse {
            properties,
            content_range,
            body,
        } = response;
        let offset = self.cursor.last_offset_acked;

        match content_range {
            Some(cr) if cr.first != offset => {
                return Err(self.fail(RemoteError::invalid_range(format!(
                    "store served {cr}, expected a range starting at {offset}"
                ))));
            }
            // No range means the whole object, which only fits a read from 0
            // or an empty read at the end.
            None if offset > 0 && offset < properties.content_length => {
                return Err(self.fail(RemoteError::invalid_range(format!(
                    "store served the whole object, expected a range starting at {offset}"
                ))));
            }
            _ => {}
        }

        match &self.properties {
            None => {
                let object_len = properties.content_length;
                if self.cursor.requested_offset > object_len {
                    return Err(self.fail(RemoteError::invalid_range(format!(
                        "offset {} is past the end of a {object_len} byte object",
                        self.cursor.requested_offset
                    ))));
                }
                let end = self
                    .cursor
                    .requested_end
                    .map_or(object_len, |end| end.min(object_len));
                self.cursor.requested_end = Some(end);

                let whole_object = self.cursor.requested_offset == 0 && end == object_len;
                if self.options.verify_hash {
                    if whole_object && properties.content_md5.is_some() {
                        self.hasher = Some(Md5::new());
                    } else {
                        debug!(
                            path = %self.path,
                            whole_object,
                            "skipping hash verification"
                        );
                    }
                }
                self.properties = Some(properties);
            }
            Some(first) if first.etag != properties.etag => {
                let message = format!(
                    "object changed during read: etag {} became {}",
                    first.etag, properties.etag
                );
                return Err(self.fail(RemoteError::precondition_failed(message)));
            }
            Some(_) => {}
        }

        self.state = ReadState::Streaming(body);
        Ok(())
    }

    /// Records delivered bytes and returns them to the caller.
    fn accept(&mut self, chunk: Bytes) -> Result<Bytes, TransferError> {
        let remaining = self.cursor.remaining().unwrap_or(u64::MAX);
        let n = chunk.len() as u64;
        if n > remaining {
            return Err(self.fail(RemoteError::invalid_range(format!(
                "store returned {n} bytes with only {remaining} outstanding"
            ))));
        }

        self.cursor.advance(n);
        self.delivered_since_reset += n;
        if let Some(hasher) = &mut self.hasher {
            hasher.update(&chunk);
        }
        if let Some(progress) = &self.progress {
            progress.add(n);
        }
        Ok(chunk)
    }

    /// Decides between resuming and failing. `Ok` means a retry was scheduled.
    fn on_failure(&mut self, error: RemoteError) -> Result<(), TransferError> {
        if !error.is_retryable() {
            return Err(self.fail(error));
        }
        if self.retries_used >= self.options.retry_budget {
            warn!(
                path = %self.path,
                retries = self.retries_used,
                error = %error,
                "read retry budget exhausted"
            );
            return Err(self.fail(error));
        }
        if self.delivered_since_reset == 0 {
            warn!(
                path = %self.path,
                offset = self.cursor.last_offset_acked,
                error = %error,
                "read failed without progress, not retrying"
            );
            return Err(self.fail(error));
        }

        self.retries_used += 1;
        self.delivered_since_reset = 0;
        self.state = ReadState::Retrying;
        warn!(
            path = %self.path,
            offset = self.cursor.last_offset_acked,
            retry = self.retries_used,
            error = %error,
            "read interrupted, resuming"
        );
        Ok(())
    }

    fn fail(&mut self, error: RemoteError) -> TransferError {
        self.state = ReadState::Failed;
        TransferError::from_remote(self.current, error)
    }

    fn finish(&mut self) -> Result<(), TransferError> {
        if let Some(hasher) = self.hasher.take() {
            let actual = hex::encode(hasher.finalize());
            let expected = self
                .properties
                .as_ref()
                .and_then(|p| p.content_md5.clone())
                .unwrap_or_default();
            if !actual.eq_ignore_ascii_case(&expected) {
                self.state = ReadState::Failed;
                return Err(TransferError::Integrity { expected, actual });
            }
            debug!(path = %self.path, md5 = %actual, "content hash verified");
        }
        self.state = ReadState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{CommitOptions, StoreFuture, once_stream};
    use lakeflow_protocol::{ContentRange, ObjectInfo, RemoteErrorKind};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What one scripted `read_range` call does.
    #[derive(Clone)]
    enum Script {
        /// Serve the requested range, failing with `error` after `after` bytes.
        BreakAfter { after: u64, error: RemoteError },
        /// Fail the request itself.
        Refuse(RemoteError),
        /// Serve `after` bytes, then end the stream cleanly.
        EndEarly { after: u64 },
        /// Serve the whole object without a content range, ignoring the offset.
        IgnoreRange,
        /// Serve with a different etag.
        Replaced,
        /// Serve normally.
        Serve,
    }

    struct ScriptedStore {
        data: Bytes,
        md5: Option<String>,
        script: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<(u64, Option<u64>, Preconditions)>>,
        chunk: usize,
    }

    impl ScriptedStore {
        fn new(data: Vec<u8>, script: Vec<Script>) -> Self {
            Self {
                data: Bytes::from(data),
                md5: None,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
                chunk: 16,
            }
        }

        fn with_md5(mut self, md5: &str) -> Self {
            self.md5 = Some(md5.to_string());
            self
        }

        fn calls(&self) -> Vec<(u64, Option<u64>)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(o, l, _)| (*o, *l))
                .collect()
        }

        fn properties(&self, etag: &str) -> ObjectProperties {
            ObjectProperties {
                content_length: self.data.len() as u64,
                etag: etag.to_string(),
                last_modified: chrono::Utc::now(),
                content_md5: self.md5.clone(),
            }
        }
    }

    impl PathStore for ScriptedStore {
        fn create<'a>(&'a self, _: &'a str, _: &'a Preconditions) -> StoreFuture<'a, ObjectInfo> {
            Box::pin(async { Err(RemoteError::other("unused")) })
        }

        fn append<'a>(
            &'a self,
            _: &'a str,
            _: TransferRange,
            _: ByteStream,
            _: Option<&'a str>,
        ) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(RemoteError::other("unused")) })
        }

        fn commit<'a>(&'a self, _: &'a str, _: u64, _: &'a CommitOptions) -> StoreFuture<'a, ObjectInfo> {
            Box::pin(async { Err(RemoteError::other("unused")) })
        }

        fn read_range<'a>(
            &'a self,
            _: &'a str,
            offset: u64,
            length: Option<u64>,
            preconditions: &'a Preconditions,
        ) -> StoreFuture<'a, ReadResponse> {
            self.calls
                .lock()
                .unwrap()
                .push((offset, length, preconditions.clone()));
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Serve);

            Box::pin(async move {
                let total = self.data.len() as u64;
                let end = length.map_or(total, |l| (offset + l).min(total));
                let slice = self.data.slice(offset as usize..end as usize);

                let (etag, limit, error) = match step {
                    Script::IgnoreRange => {
                        return Ok(ReadResponse {
                            properties: self.properties("v1"),
                            content_range: None,
                            body: once_stream(self.data.clone()),
                        });
                    }
                    Script::Refuse(e) => return Err(e),
                    Script::Replaced => ("v2", None, None),
                    Script::Serve => ("v1", None, None),
                    Script::EndEarly { after } => ("v1", Some(after as usize), None),
                    Script::BreakAfter { after, error } => ("v1", Some(after as usize), Some(error)),
                };

                let served = match limit {
                    Some(after) => slice.slice(..after.min(slice.len())),
                    None => slice,
                };
                let mut items: Vec<Result<Bytes, RemoteError>> = served
                    .chunks(self.chunk)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                if let Some(error) = error {
                    items.push(Err(error));
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
                    properties: self.properties(etag),
                    content_range,
                    body: Box::pin(futures_util::stream::iter(items)),
                })
            })
        }
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    async fn read_all(reader: &mut ResilientReader) -> Result<Vec<u8>, TransferError> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn options(retry_budget: u32) -> ReaderOptions {
        ReaderOptions {
            retry_budget,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resumes_from_last_delivered_offset() {
        let data = payload(100);
        let store = Arc::new(ScriptedStore::new(
            data.clone(),
            vec![Script::BreakAfter {
                after: 40,
                error: RemoteError::transient("connection reset"),
            }],
        ));
        let mut reader = ResilientReader::new(
            store.clone(),
            "f",
            Some(TransferRange::new(0, 100).unwrap()),
            options(2),
        )
        .unwrap();

        let out = read_all(&mut reader).await.unwrap();

        assert_eq!(out, data);
        assert_eq!(store.calls(), vec![(0, Some(100)), (40, Some(60))]);
        assert_eq!(reader.retries_used(), 1);
        assert_eq!(reader.cursor().bytes_delivered, 100);
    }

    #[tokio::test]
    async fn retry_is_pinned_to_first_etag() {
        let store = Arc::new(ScriptedStore::new(
            payload(50),
            vec![Script::BreakAfter {
                after: 10,
                error: RemoteError::timeout("slow"),
            }],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(3)).unwrap();
        read_all(&mut reader).await.unwrap();

        let calls = store.calls.lock().unwrap();
        assert!(calls[0].2.if_match.is_none());
        assert_eq!(calls[1].2.if_match.as_deref(), Some("v1"));
        // Whole-object read: first call open-ended, retry bounded.
        assert_eq!((calls[0].0, calls[0].1), (0, None));
        assert_eq!((calls[1].0, calls[1].1), (10, Some(40)));
    }

    #[tokio::test]
    async fn replaced_object_fails_with_precondition() {
        let store = Arc::new(ScriptedStore::new(
            payload(50),
            vec![
                Script::BreakAfter {
                    after: 10,
                    error: RemoteError::transient("reset"),
                },
                Script::Replaced,
            ],
        ));
        let mut reader = ResilientReader::new(store, "f", None, options(3)).unwrap();
        let err = read_all(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn budget_exhaustion_surfaces_transport_error() {
        let failure = || Script::BreakAfter {
            after: 10,
            error: RemoteError::transient("reset"),
        };
        let store = Arc::new(ScriptedStore::new(
            payload(100),
            vec![failure(), failure(), failure()],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(2)).unwrap();
        let err = read_all(&mut reader).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientTransport);
        assert_eq!(store.calls().len(), 3);
        assert_eq!(reader.cursor().last_offset_acked, 30);
        // The reader is spent.
        assert!(reader.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let store = Arc::new(ScriptedStore::new(
            payload(100),
            vec![Script::BreakAfter {
                after: 10,
                error: RemoteError::new(RemoteErrorKind::Unauthorized, "token expired"),
            }],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(5)).unwrap();
        let err = read_all(&mut reader).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Remote);
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn zero_progress_failure_is_not_retried() {
        let store = Arc::new(ScriptedStore::new(
            payload(100),
            vec![Script::BreakAfter {
                after: 0,
                error: RemoteError::transient("reset"),
            }],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(5)).unwrap();
        assert!(read_all(&mut reader).await.is_err());
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn resume_rejects_whole_object_response() {
        let data = payload(100);
        let store = Arc::new(ScriptedStore::new(
            data.clone(),
            vec![
                Script::BreakAfter {
                    after: 40,
                    error: RemoteError::transient("connection reset"),
                },
                Script::IgnoreRange,
            ],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(3)).unwrap();

        let mut out = Vec::new();
        let err = loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => out.extend_from_slice(&chunk),
                Ok(None) => panic!("read should not complete"),
                Err(e) => break e,
            }
        };

        assert!(matches!(
            &err,
            TransferError::Remote { source, .. } if source.kind == RemoteErrorKind::InvalidRange
        ));
        // Nothing from the restarted object reaches the caller.
        assert_eq!(out, data[..40]);
        assert_eq!(store.calls(), vec![(0, None), (40, Some(60))]);
    }

    #[tokio::test]
    async fn refused_request_surfaces_immediately() {
        let store = Arc::new(ScriptedStore::new(
            payload(10),
            vec![Script::Refuse(RemoteError::precondition_failed("etag"))],
        ));
        let mut reader = ResilientReader::new(store, "f", None, options(5)).unwrap();
        let err = reader.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn premature_end_counts_as_transport_failure() {
        let store = Arc::new(ScriptedStore::new(
            payload(64),
            vec![Script::EndEarly { after: 32 }],
        ));
        let mut reader = ResilientReader::new(store.clone(), "f", None, options(1)).unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), payload(64));
        assert_eq!(store.calls(), vec![(0, None), (32, Some(32))]);
    }

    #[tokio::test]
    async fn hash_verification_passes_and_detects_corruption() {
        let data = payload(70);
        let good = hex::encode(Md5::digest(&data));

        let store = Arc::new(ScriptedStore::new(data.clone(), vec![]).with_md5(&good));
        let mut reader = ResilientReader::new(
            store,
            "f",
            None,
            ReaderOptions {
                verify_hash: true,
                retry_budget: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), data);

        let store = Arc::new(
            ScriptedStore::new(data, vec![]).with_md5("00000000000000000000000000000000"),
        );
        let mut reader = ResilientReader::new(
            store,
            "f",
            None,
            ReaderOptions {
                verify_hash: true,
                retry_budget: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let err = read_all(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn partial_range_skips_hash_verification() {
        let store = Arc::new(
            ScriptedStore::new(payload(70), vec![]).with_md5("00000000000000000000000000000000"),
        );
        let mut reader = ResilientReader::new(
            store,
            "f",
            Some(TransferRange::new(10, 20).unwrap()),
            ReaderOptions {
                verify_hash: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), payload(70)[10..30]);
    }

    #[tokio::test]
    async fn range_past_object_end_is_clamped() {
        let store = Arc::new(ScriptedStore::new(payload(30), vec![]));
        let mut reader = ResilientReader::new(
            store,
            "f",
            Some(TransferRange::new(20, 100).unwrap()),
            options(0),
        )
        .unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), payload(30)[20..]);
    }

    #[tokio::test]
    async fn into_stream_yields_in_order() {
        let data = payload(90);
        let store = Arc::new(ScriptedStore::new(
            data.clone(),
            vec![Script::BreakAfter {
                after: 33,
                error: RemoteError::transient("reset"),
            }],
        ));
        let reader = ResilientReader::new(store, "f", None, options(1)).unwrap();
        let chunks: Vec<_> = reader.into_stream().collect().await;
        let out: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(out, data);
    }
}
