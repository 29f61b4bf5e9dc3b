//! File-like sequential access layered over the positional reader.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::reader::{HttpRangeReader, ReadAt};

/// A remote HTTP resource with file semantics: sequential reads and
/// seeking, on top of [`HttpRangeReader`].
///
/// The seek cursor is the only state; it is guarded by an async mutex
/// held across the underlying positional read, so `read` plus cursor
/// advance is one atomic step. Positional [`read_at`](Self::read_at)
/// calls bypass the cursor entirely.
pub struct HttpFile {
    reader: Arc<HttpRangeReader>,
    cursor: Mutex<u64>,
}

impl HttpFile {
    /// Wraps an existing positional reader.
    pub fn new(reader: Arc<HttpRangeReader>) -> Self {
        Self {
            reader,
            cursor: Mutex::new(0),
        }
    }

    /// Reads from the current offset and advances it by the bytes read.
    ///
    /// Returns `Ok(0)` once the cursor is at or past the end.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let n = self.reader.read_at(*cursor, buf).await?;
        *cursor += n as u64;
        Ok(n)
    }

    /// Moves the cursor and returns its new position.
    ///
    /// Seeking past the end is allowed; the next `read` returns `Ok(0)`.
    /// A negative resulting position is [`Error::InvalidSeek`].
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut cursor = self.cursor.lock().await;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(*cursor) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.reader.size()) + i128::from(delta),
        };
        let target = u64::try_from(target).map_err(|_| Error::InvalidSeek)?;
        *cursor = target;
        Ok(target)
    }

    /// Positional read, independent of the seek cursor.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reader.read_at(offset, buf).await
    }

    /// Total size of the resource in bytes.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Cumulative bytes received from the network.
    pub fn transferred_bytes(&self) -> u64 {
        self.reader.transferred_bytes()
    }

    /// Releases nothing: the reader holds no connections of its own.
    /// Present for file-API symmetry.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ReadAt for HttpFile {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reader.read_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        self.reader.size()
    }
}
