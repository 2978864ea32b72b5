//! `PathStore` backed by a local directory.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<object path>                    committed bytes
//! <root>/.lakeflow/meta/<key>.json        etag, length, MD5, lease
//! <root>/.lakeflow/uncommitted/<key>.part appended bytes at absolute offsets
//! ```
//!
//! `<key>` is the MD5 of the object path. A commit writes the new content
//! to a temporary file and renames it over the object, so readers see
//! either the old or the new version.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lakeflow_protocol::constants::PROGRESS_SLICE_SIZE;
use lakeflow_protocol::{ContentRange, ObjectInfo, Preconditions, RemoteError, TransferRange};
use lakeflow_transfer::{
    ByteStream, CommitOptions, PathStore, ReadResponse, StoreFuture, content_md5, file_md5,
};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, trace};

use crate::RESERVED_DIR;
use crate::conditions::{ObjectMeta, check_lease, evaluate, next_etag};
use crate::path::validate_object_path;

/// Directory-backed object store.
pub struct LocalPathStore {
    root: PathBuf,
    /// Uncommitted extents per path: offset -> length.
    extents: Mutex<HashMap<String, BTreeMap<u64, u64>>>,
    /// Serializes create and commit, the two calls that rewrite metadata.
    meta_lock: tokio::sync::Mutex<()>,
    read_chunk_size: usize,
}

impl LocalPathStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(RESERVED_DIR).join("meta"))?;
        std::fs::create_dir_all(root.join(RESERVED_DIR).join("uncommitted"))?;
        info!(root = %root.display(), "opened local store");
        Ok(Self {
            root,
            extents: Mutex::new(HashMap::new()),
            meta_lock: tokio::sync::Mutex::new(()),
            read_chunk_size: PROGRESS_SLICE_SIZE,
        })
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the committed bytes of `path` live.
    pub fn object_file(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn key(path: &str) -> String {
        content_md5(path.as_bytes())
    }

    fn meta_file(&self, path: &str) -> PathBuf {
        self.root
            .join(RESERVED_DIR)
            .join("meta")
            .join(format!("{}.json", Self::key(path)))
    }

    fn staging_file(&self, path: &str) -> PathBuf {
        self.root
            .join(RESERVED_DIR)
            .join("uncommitted")
            .join(format!("{}.part", Self::key(path)))
    }

    fn extents(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<u64, u64>>> {
        self.extents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load_meta(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        match tokio::fs::read(self.meta_file(path)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| RemoteError::other(format!("corrupt metadata for {path}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_meta(&self, path: &str, meta: &ObjectMeta) -> Result<(), RemoteError> {
        let target = self.meta_file(path);
        let tmp = target.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(meta)
            .map_err(|e| RemoteError::other(format!("encode metadata: {e}")))?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    /// Loads metadata, adopting a plain file placed under the root by
    /// another writer.
    async fn current_meta(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        if let Some(meta) = self.load_meta(path).await? {
            return Ok(Some(meta));
        }

        let file = self.object_file(path);
        let stat = match tokio::fs::metadata(&file).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let hashed = file.clone();
        let md5 = tokio::task::spawn_blocking(move || file_md5(&hashed))
            .await
            .map_err(|e| RemoteError::other(format!("hash task failed: {e}")))?
            .map_err(|e| RemoteError::other(e.to_string()))?;
        let meta = ObjectMeta {
            etag: next_etag(),
            last_modified: stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            content_length: stat.len(),
            content_md5: md5,
            lease_id: None,
        };
        self.save_meta(path, &meta).await?;
        debug!(path, length = meta.content_length, "adopted existing file");
        Ok(Some(meta))
    }

    async fn do_create(
        &self,
        path: &str,
        conditions: &Preconditions,
    ) -> Result<ObjectInfo, RemoteError> {
        validate_object_path(path)?;
        let _guard = self.meta_lock.lock().await;

        let current = self.current_meta(path).await?;
        evaluate(current.as_ref(), conditions)?;

        let file = self.object_file(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, b"").await?;
        tokio::fs::write(self.staging_file(path), b"").await?;
        self.extents().remove(path);

        let meta = ObjectMeta::empty(conditions.lease_id.clone());
        self.save_meta(path, &meta).await?;
        debug!(path, etag = %meta.etag, "created");
        Ok(meta.info())
    }

    async fn do_append(
        &self,
        path: &str,
        range: TransferRange,
        mut data: ByteStream,
        lease_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        validate_object_path(path)?;
        let meta = self
            .load_meta(path)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
        check_lease(&meta, lease_id)?;
        if range.offset < meta.content_length {
            return Err(RemoteError::invalid_range(format!(
                "append {range} overlaps committed data ending at {}",
                meta.content_length
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.staging_file(path))
            .await?;
        file.seek(SeekFrom::Start(range.offset)).await?;

        let mut written = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > range.length {
                return Err(RemoteError::invalid_range(format!(
                    "append {range} carried more than {} bytes",
                    range.length
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        if written != range.length {
            return Err(RemoteError::invalid_range(format!(
                "append {range} carried {written} bytes"
            )));
        }

        self.extents()
            .entry(path.to_string())
            .or_default()
            .insert(range.offset, range.length);
        trace!(path, %range, "appended");
        Ok(())
    }

    async fn do_commit(
        &self,
        path: &str,
        final_length: u64,
        options: &CommitOptions,
    ) -> Result<ObjectInfo, RemoteError> {
        validate_object_path(path)?;
        let _guard = self.meta_lock.lock().await;

        let meta = self
            .load_meta(path)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
        evaluate(Some(&meta), &options.preconditions)?;
        check_lease(&meta, options.preconditions.lease_id.as_deref())?;

        let committed_len = meta.content_length;
        if final_length < committed_len {
            return Err(RemoteError::invalid_range(format!(
                "commit at {final_length} is below the committed length {committed_len}"
            )));
        }
        let leftover = {
            let extents = self.extents();
            let current = extents.get(path).cloned().unwrap_or_default();
            split_extents(&current, committed_len, final_length)?
        };

        let object = self.object_file(path);
        let tmp = self.staging_file(path).with_extension("commit");
        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Md5::new();
        copy_range(&object, 0, committed_len, &mut out, &mut hasher).await?;
        copy_range(
            &self.staging_file(path),
            committed_len,
            final_length - committed_len,
            &mut out,
            &mut hasher,
        )
        .await?;
        out.sync_all().await?;
        drop(out);
        tokio::fs::rename(&tmp, &object).await?;

        let updated = ObjectMeta {
            etag: next_etag(),
            last_modified: Utc::now(),
            content_length: final_length,
            content_md5: hex::encode(hasher.finalize()),
            lease_id: if options.close {
                None
            } else {
                meta.lease_id.clone()
            },
        };
        self.save_meta(path, &updated).await?;

        if options.retain_uncommitted {
            self.extents().insert(path.to_string(), leftover);
        } else {
            self.extents().remove(path);
            tokio::fs::write(self.staging_file(path), b"").await?;
        }
        debug!(path, final_length, etag = %updated.etag, "committed");
        Ok(updated.info())
    }

    async fn do_read(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
        conditions: &Preconditions,
    ) -> Result<ReadResponse, RemoteError> {
        validate_object_path(path)?;
        let meta = self
            .current_meta(path)
            .await?
            .ok_or_else(|| RemoteError::not_found(format!("path {path} does not exist")))?;
        evaluate(Some(&meta), conditions)?;

        let total = meta.content_length;
        if offset > total || (offset == total && total > 0) {
            return Err(RemoteError::invalid_range(format!(
                "offset {offset} is outside a {total} byte object"
            )));
        }
        let end = length.map_or(total, |len| offset.saturating_add(len).min(total));

        let mut file = tokio::fs::File::open(self.object_file(path)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let body = ReaderStream::with_capacity(file.take(end - offset), self.read_chunk_size)
            .map(|chunk| chunk.map_err(RemoteError::from));

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
            body: Box::pin(body),
        })
    }
}

/// Checks that `extents` cover `[from, to)` without gaps and returns what
/// lies beyond `to`.
fn split_extents(
    extents: &BTreeMap<u64, u64>,
    from: u64,
    to: u64,
) -> Result<BTreeMap<u64, u64>, RemoteError> {
    let mut cursor = from;
    let mut leftover = BTreeMap::new();
    for (&offset, &len) in extents {
        let end = offset + len;
        if offset >= to || cursor >= to {
            leftover.insert(offset, len);
            continue;
        }
        if end <= cursor {
            continue;
        }
        if offset > cursor {
            return Err(RemoteError::invalid_range(format!(
                "commit at {to}: no data at offset {cursor}"
            )));
        }
        cursor = end.min(to);
        if end > to {
            leftover.insert(to, end - to);
        }
    }
    if cursor != to {
        return Err(RemoteError::invalid_range(format!(
            "commit at {to}: data ends at {cursor}"
        )));
    }
    Ok(leftover)
}

/// Copies `len` bytes at `offset` of `src` into `out`, hashing them.
async fn copy_range(
    src: &Path,
    offset: u64,
    len: u64,
    out: &mut tokio::fs::File,
    hasher: &mut Md5,
) -> Result<(), RemoteError> {
    if len == 0 {
        return Ok(());
    }
    let mut file = tokio::fs::File::open(src).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut reader = file.take(len);
    let mut buf = vec![0u8; PROGRESS_SLICE_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    if copied != len {
        return Err(RemoteError::other(format!(
            "{} ended after {copied} of {len} bytes",
            src.display()
        )));
    }
    Ok(())
}

impl PathStore for LocalPathStore {
    fn create<'a>(
        &'a self,
        path: &'a str,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(self.do_create(path, preconditions))
    }

    fn append<'a>(
        &'a self,
        path: &'a str,
        range: TransferRange,
        data: ByteStream,
        lease_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.do_append(path, range, data, lease_id))
    }

    fn commit<'a>(
        &'a self,
        path: &'a str,
        final_length: u64,
        options: &'a CommitOptions,
    ) -> StoreFuture<'a, ObjectInfo> {
        Box::pin(self.do_commit(path, final_length, options))
    }

    fn read_range<'a>(
        &'a self,
        path: &'a str,
        offset: u64,
        length: Option<u64>,
        preconditions: &'a Preconditions,
    ) -> StoreFuture<'a, ReadResponse> {
        Box::pin(self.do_read(path, offset, length, preconditions))
    }
}
