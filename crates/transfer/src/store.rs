//! Remote store collaborator.
//!
//! `PathStore` is the only way the engine talks to the service. Wire
//! encoding, authentication and transport-level retries live behind it;
//! the engine sees return values and [`RemoteError`]s only.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use lakeflow_protocol::{
    ContentRange, ObjectInfo, ObjectProperties, Preconditions, RemoteError, TransferRange,
};

/// A stream of bytes flowing to or from the store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

/// Boxed future returned by every [`PathStore`] call.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Options for the commit ("flush") call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Keep appended data beyond `final_length` for a later commit.
    pub retain_uncommitted: bool,
    /// Signal that this is the final commit of the write session.
    pub close: bool,
    pub preconditions: Preconditions,
}

/// Response to a ranged read.
pub struct ReadResponse {
    pub properties: ObjectProperties,
    /// Range actually served; `None` when the store served the whole object,
    /// or nothing because the request started at its end.
    pub content_range: Option<ContentRange>,
    pub body: ByteStream,
}

impl std::fmt::Debug for ReadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResponse")
            .field("properties", &self.properties)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Abstract connection to a hierarchical-namespace object store.
///
/// Implementations must be safe to call concurrently: the dispatcher issues
/// several `append` calls for the same path at once.
pub trait PathStore: Send + Sync {
    /// Creates (or replaces) an empty object at `path`.
    fn create<'a>(
        &'a self,
        path: &'a str,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ObjectInfo>;

    /// Appends `range.length` bytes read from `data` at `range.offset` into
    /// the object's uncommitted area. The store must drain `data`.
    fn append<'a>(
        &'a self,
        path: &'a str,
        range: TransferRange,
        data: ByteStream,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;

    /// Makes appended data visible up to `final_length`.
    fn commit<'a>(
        &'a self,
        path: &'a str,
        final_length: u64,
        options: &'a CommitOptions,
    ) -> StoreFuture<'a, ObjectInfo>;

    /// Reads `length` bytes starting at `offset`, or to the end when `length` is `None`.
    fn read_range<'a>(
        &'a self,
        path: &'a str,
        offset: u64,
        length: Option<u64>,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ReadResponse>;
}

/// Wraps a single buffer as a [`ByteStream`].
pub fn once_stream(data: Bytes) -> ByteStream {
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// Drains a [`ByteStream`] into one contiguous buffer.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes, RemoteError> {
    use futures_util::StreamExt;

    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
