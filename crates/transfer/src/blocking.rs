//! Synchronous facade over the async engine.
//!
//! Both surfaces drive the same state machines; this one just owns a
//! runtime and blocks on it.

use std::io::{Read, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use lakeflow_protocol::{ObjectInfo, ObjectProperties, constants::PROGRESS_SLICE_SIZE};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::FileTransferClient;
use crate::config::{DownloadOptions, UploadOptions};
use crate::download::next_or_cancel;
use crate::error::TransferError;

/// Fragments buffered between a blocking reader and the upload pipeline.
const READER_CHANNEL_DEPTH: usize = 4;

/// Blocking transfer client for callers without a runtime.
///
/// Must not be used from inside an async context.
pub struct BlockingTransferClient {
    runtime: Runtime,
    client: FileTransferClient,
}

impl BlockingTransferClient {
    pub fn new(client: FileTransferClient) -> Result<Self, TransferError> {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("lakeflow-transfer")
            .build()?;
        Ok(Self { runtime, client })
    }

    pub fn client(&self) -> &FileTransferClient {
        &self.client
    }

    pub fn upload_file(
        &self,
        local: &Path,
        options: UploadOptions,
    ) -> Result<ObjectInfo, TransferError> {
        self.runtime.block_on(self.client.upload_file(local, options))
    }

    /// Uploads everything `reader` yields until EOF.
    ///
    /// The reader runs on the runtime's blocking pool and hands fragments
    /// over a bounded channel, so it stalls while the dispatcher is full.
    pub fn upload_reader<R>(
        &self,
        mut reader: R,
        len_hint: Option<u64>,
        options: UploadOptions,
    ) -> Result<ObjectInfo, TransferError>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(READER_CHANNEL_DEPTH);

        self.runtime.spawn_blocking(move || {
            loop {
                let mut buf = BytesMut::zeroed(PROGRESS_SLICE_SIZE);
                let item = match reader.read(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf.freeze())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    debug!("reader feed stopped");
                    return;
                }
            }
        });

        let source = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        self.runtime
            .block_on(self.client.upload_stream(source, len_hint, options))
    }

    pub fn download_to_file(
        &self,
        local: &Path,
        overwrite: bool,
        options: DownloadOptions,
    ) -> Result<ObjectProperties, TransferError> {
        self.runtime
            .block_on(self.client.download_to_file(local, overwrite, options))
    }

    /// Streams the requested range into a synchronous writer.
    pub fn download_to_writer<W>(
        &self,
        writer: &mut W,
        options: DownloadOptions,
    ) -> Result<ObjectProperties, TransferError>
    where
        W: Write + ?Sized,
    {
        let mut reader = self.runtime.block_on(self.client.open_reader(&options))?;
        while let Some(chunk) = self
            .runtime
            .block_on(next_or_cancel(&options.cancel, reader.next_chunk()))?
        {
            writer.write_all(&chunk)?;
        }
        writer.flush()?;

        reader
            .properties()
            .cloned()
            .ok_or(TransferError::InvalidState("download finished without a response"))
    }
}
