//! Byte sources for uploads.
//!
//! The engine never copies a file up front; it slices lazily, reading a
//! range only when the chunk that owns it is dispatched or hashed.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom};

/// Buffer size for range reads (64KB)
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// An externally owned, read-only byte source.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Total size in bytes
    fn size(&self) -> u64;

    /// Display name, used for session creation and fingerprinting
    fn name(&self) -> &str;

    /// MIME type if known
    fn mime_type(&self) -> Option<&str>;

    /// Last modification time, unix seconds
    fn last_modified(&self) -> i64;

    /// Read the byte range `[start, end)`.
    ///
    /// `end` must not exceed [`FileSource::size`]. The read happens at call
    /// time; holding a range does not pin any bytes in memory.
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes>;

    /// Identity used to reassociate a re-selected file with a persisted
    /// task record. No content bytes are involved.
    fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.name(), self.size(), self.last_modified())
    }
}

/// A source backed by a file on disk.
///
/// Each range read opens its own handle, so concurrent chunk jobs never
/// contend on a shared seek position.
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
    mime_type: Option<String>,
    last_modified: i64,
}

impl LocalFile {
    /// Open a local file and capture its metadata.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            mime_type: None,
            last_modified,
        })
    }

    /// Attach a MIME type detected by the host.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSource for LocalFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        if end < start || end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range [{start}, {end}) out of bounds for size {}", self.size),
            ));
        }
        let len = (end - start) as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let file = File::open(&self.path).await?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE.min(len), file);
        reader.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// A source backed by an in-memory buffer.
pub struct MemoryFile {
    name: String,
    bytes: Bytes,
    mime_type: Option<String>,
    last_modified: i64,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_type: None,
            last_modified: 0,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_last_modified(mut self, unix_seconds: i64) -> Self {
        self.last_modified = unix_seconds;
        self
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn last_modified(&self) -> i64 {
        self.last_modified
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        if end < start || end > self.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("range [{start}, {end}) out of bounds for size {}", self.size()),
            ));
        }
        Ok(self.bytes.slice(start as usize..end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn memory_file_slices_lazily() {
        let source = MemoryFile::new("a.bin", vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(source.size(), 8);
        let range = source.read_range(2, 5).await.unwrap();
        assert_eq!(&range[..], &[2, 3, 4]);
        let empty = source.read_range(8, 8).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn memory_file_rejects_out_of_bounds() {
        let source = MemoryFile::new("a.bin", vec![0u8; 4]);
        assert!(source.read_range(0, 5).await.is_err());
        assert!(source.read_range(3, 2).await.is_err());
    }

    #[tokio::test]
    async fn local_file_reads_ranges() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let payload: Vec<u8> = (0..=255u8).collect();
        tmp.write_all(&payload).unwrap();
        tmp.flush().unwrap();

        let source = LocalFile::open(tmp.path()).await.unwrap();
        assert_eq!(source.size(), 256);

        let head = source.read_range(0, 4).await.unwrap();
        assert_eq!(&head[..], &[0, 1, 2, 3]);
        let tail = source.read_range(252, 256).await.unwrap();
        assert_eq!(&tail[..], &[252, 253, 254, 255]);
        assert!(source.read_range(250, 300).await.is_err());
    }

    #[tokio::test]
    async fn fingerprint_combines_name_size_and_mtime() {
        let source = MemoryFile::new("report.pdf", vec![0u8; 10]).with_last_modified(1700000000);
        assert_eq!(source.fingerprint(), "report.pdf:10:1700000000");
    }
}
