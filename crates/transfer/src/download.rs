//! Download orchestration over the resilient reader.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lakeflow_protocol::ObjectProperties;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::FileTransferClient;
use crate::config::DownloadOptions;
use crate::error::TransferError;
use crate::progress::ProgressAccumulator;
use crate::reader::{ReaderOptions, ResilientReader};

impl FileTransferClient {
    /// Builds a reader for `options` without issuing any request.
    ///
    /// An empty or overflowing `options.range` fails with `Configuration`.
    pub fn reader(&self, options: &DownloadOptions) -> Result<ResilientReader, TransferError> {
        ResilientReader::new(
            Arc::clone(&self.store),
            &self.path,
            options.range,
            ReaderOptions {
                retry_budget: options.resolve_retry_budget(&self.config),
                verify_hash: options.verify_hash,
                preconditions: options.preconditions.clone(),
            },
        )
    }

    /// Opens a reader and attaches progress reporting once the length is known.
    pub(crate) async fn open_reader(
        &self,
        options: &DownloadOptions,
    ) -> Result<ResilientReader, TransferError> {
        let mut reader = self.reader(options)?;
        next_or_cancel(&options.cancel, reader.open()).await?;

        let total = reader.cursor().remaining();
        let progress = Arc::new(ProgressAccumulator::new(
            total,
            options.progress.clone(),
            self.config.speed_window(),
        ));
        Ok(reader.with_progress(progress))
    }

    /// Streams the requested range into `sink`, in order.
    ///
    /// Returns the object's properties as reported by the first response.
    pub async fn download_to<W>(
        &self,
        sink: &mut W,
        options: DownloadOptions,
    ) -> Result<ObjectProperties, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self.open_reader(&options).await?;

        while let Some(chunk) = next_or_cancel(&options.cancel, reader.next_chunk()).await? {
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;

        let properties = reader
            .properties()
            .cloned()
            .ok_or(TransferError::InvalidState("download finished without a response"))?;
        info!(
            path = %self.path,
            bytes = reader.cursor().bytes_delivered,
            retries = reader.retries_used(),
            "download complete"
        );
        Ok(properties)
    }

    /// Downloads into a local file.
    ///
    /// Without `overwrite` an existing destination is an error. With
    /// `overwrite` the data lands in a sibling file that replaces the
    /// destination only once the download succeeded, so a failed download
    /// leaves an existing file untouched. Partial files are removed.
    pub async fn download_to_file(
        &self,
        local: &Path,
        overwrite: bool,
        options: DownloadOptions,
    ) -> Result<ObjectProperties, TransferError> {
        if let Some(parent) = local.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut open = tokio::fs::OpenOptions::new();
        open.write(true);
        let target = if overwrite {
            open.create(true).truncate(true);
            partial_path(local)?
        } else {
            open.create_new(true);
            local.to_path_buf()
        };
        let file = open.open(&target).await?;
        let mut writer = BufWriter::new(file);

        let mut result = self.download_to(&mut writer, options).await;
        if let Ok(properties) = result {
            result = writer
                .into_inner()
                .sync_all()
                .await
                .map(|()| properties)
                .map_err(TransferError::from);
        }
        if result.is_ok() && overwrite {
            result = match tokio::fs::rename(&target, local).await {
                Ok(()) => result,
                Err(e) => Err(e.into()),
            };
        }

        if result.is_err()
            && let Err(e) = tokio::fs::remove_file(&target).await
        {
            warn!(local = %target.display(), error = %e, "failed to remove partial download");
        }
        result
    }
}

/// Sibling file an overwriting download is written to before the rename.
fn partial_path(local: &Path) -> Result<PathBuf, TransferError> {
    let name = local.file_name().ok_or_else(|| {
        TransferError::Configuration(format!("{} does not name a file", local.display()))
    })?;
    let mut partial = OsString::from(".");
    partial.push(name);
    partial.push(".lakeflow-part");
    Ok(local.with_file_name(partial))
}

/// Awaits one reader step unless the transfer is cancelled first.
pub(crate) async fn next_or_cancel<F, T>(
    cancel: &CancellationToken,
    step: F,
) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = step => result,
    }
}
