use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use lakeflow_protocol::TransferRange;
use md5::{Digest, Md5};

use crate::error::TransferError;
use crate::types::StagedBlock;

// ---------------------------------------------------------------------------
// Hash helpers
// ---------------------------------------------------------------------------

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn content_md5(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of an entire file and returns the hex-encoded digest.
pub fn file_md5(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads planned block ranges out of a local file.
///
/// The file length is captured at open time; a file that shrinks while it
/// is read fails with `UnexpectedEof` instead of producing short blocks.
pub struct ChunkReader {
    file: File,
    path: PathBuf,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for block reads.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_size,
        })
    }

    /// Reads exactly `range.length` bytes at `range.offset`.
    pub fn read_block(&mut self, range: TransferRange) -> Result<StagedBlock, TransferError> {
        if range.end() > self.file_size {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} is {} bytes, cannot read {range}",
                    self.path.display(),
                    self.file_size
                ),
            )));
        }

        let len = usize::try_from(range.length)
            .map_err(|_| TransferError::Configuration(format!("block {range} is too large")))?;
        let mut buf = BytesMut::zeroed(len);
        self.file.seek(SeekFrom::Start(range.offset))?;
        self.file.read_exact(&mut buf)?;

        Ok(StagedBlock {
            range,
            data: buf.freeze(),
        })
    }

    /// Reads a block on the blocking pool, handing the reader back.
    pub async fn read_block_async(
        mut self,
        range: TransferRange,
    ) -> Result<(Self, StagedBlock), TransferError> {
        tokio::task::spawn_blocking(move || {
            let block = self.read_block(range)?;
            Ok((self, block))
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    /// Total file size in bytes, as seen at open time.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ChunkPlanner;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn content_md5_known_value() {
        assert_eq!(content_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            content_md5(b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn file_md5_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let data = b"test content for checksum";
        let path = create_test_file(dir.path(), "test.bin", data);

        assert_eq!(file_md5(&path).unwrap(), content_md5(data));
    }

    #[test]
    fn reads_planned_ranges() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let mut reader = ChunkReader::open(&path).unwrap();
        assert_eq!(reader.file_size(), 10);

        let planner = ChunkPlanner::with_block_size(4, 1024).unwrap();
        let blocks: Vec<StagedBlock> = planner
            .ranges(reader.file_size())
            .map(|r| reader.read_block(r).unwrap())
            .collect();

        assert_eq!(blocks.len(), 3);
        assert_eq!(&blocks[0].data[..], b"AABB");
        assert_eq!(&blocks[1].data[..], b"CCDD");
        assert_eq!(&blocks[2].data[..], b"EE");
        assert_eq!(blocks[2].range, TransferRange { offset: 8, length: 2 });
    }

    #[test]
    fn reads_out_of_order() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123456789");

        let mut reader = ChunkReader::open(&path).unwrap();
        let late = reader.read_block(TransferRange { offset: 6, length: 4 }).unwrap();
        let early = reader.read_block(TransferRange { offset: 0, length: 3 }).unwrap();
        assert_eq!(&late.data[..], b"6789");
        assert_eq!(&early.data[..], b"012");
    }

    #[test]
    fn range_past_end_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"short");

        let mut reader = ChunkReader::open(&path).unwrap();
        let err = reader
            .read_block(TransferRange { offset: 3, length: 10 })
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn async_read_returns_reader() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"abcdef");

        let reader = ChunkReader::open(&path).unwrap();
        let (reader, first) = reader
            .read_block_async(TransferRange { offset: 0, length: 3 })
            .await
            .unwrap();
        let (_, second) = reader
            .read_block_async(TransferRange { offset: 3, length: 3 })
            .await
            .unwrap();
        assert_eq!(&first.data[..], b"abc");
        assert_eq!(&second.data[..], b"def");
    }
}
