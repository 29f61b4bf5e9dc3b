//! Positional reads from a remote HTTP resource.
//!
//! This module implements random-access reading from HTTP servers using
//! the Range request header (RFC 7233), so arbitrary byte ranges of a
//! large remote resource can be read without downloading the whole thing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::ACCEPT_RANGES;
use reqwest::{Client, IntoUrl, Method, Request, StatusCode, Url};
use tracing::debug;

use crate::error::{Error, Result};
use crate::meta::Metadata;
use crate::transport::{format_range, Transport};

/// Trait for random access reading from a data source.
///
/// A positional read carries its own offset and touches no cursor, so a
/// single reader may serve any number of concurrent callers.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer.
    ///
    /// Returns the number of bytes read: `0` at or past the end, and
    /// possibly fewer than `buf.len()` near the end.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source.
    fn size(&self) -> u64;
}

/// HTTP Range reader for remote resources.
///
/// Each positional read becomes one conditional `Range` GET through the
/// configured [`Transport`]. The validators the server handed out at open
/// time (`ETag`, `Last-Modified`) are attached as `If-Match` /
/// `If-Unmodified-Since` preconditions so a resource changing under us
/// fails the read instead of silently mixing versions.
///
/// ## Requirements
///
/// The remote server must:
/// - Support HTTP Range requests (indicated by `Accept-Ranges: bytes`)
/// - Provide a positive `Content-Length` in HEAD responses
///
/// ## Concurrency
///
/// `read_at` may be awaited concurrently from any number of tasks. The
/// only mutable state is the metadata snapshot, updated atomically behind
/// a read-write lock, and a relaxed transfer counter.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use httpfile::{HttpRangeReader, ReadAt};
///
/// # async fn example() -> httpfile::Result<()> {
/// let reader =
///     HttpRangeReader::open_with_client("https://example.com/large.bin", reqwest::Client::new())
///         .await?;
/// let mut buf = [0u8; 16];
/// let n = reader.read_at(1024, &mut buf).await?;
/// println!("{} bytes at offset 1024", n);
/// # Ok(())
/// # }
/// ```
pub struct HttpRangeReader {
    /// Transport every request goes through.
    transport: Arc<dyn Transport>,
    /// The URL of the remote resource.
    url: Url,
    /// Total size in bytes, fixed at open time.
    size: u64,
    /// Validator snapshot; strict comparison against every response.
    meta: RwLock<Metadata>,
    /// Cumulative bytes received from the network.
    transferred: AtomicU64,
}

impl std::fmt::Debug for HttpRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRangeReader")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("meta", &self.meta)
            .field("transferred", &self.transferred)
            .finish()
    }
}

impl HttpRangeReader {
    /// Opens `url` through `transport`.
    ///
    /// Issues a HEAD request to verify the server responds successfully,
    /// advertises byte-range support, and declares a positive length, and
    /// takes the initial validator snapshot from its headers.
    ///
    /// # Errors
    ///
    /// [`Error::Head`] on a non-2xx response, [`Error::MissingLength`]
    /// when no positive length is declared, [`Error::RangesUnsupported`]
    /// when `Accept-Ranges` does not contain `bytes`.
    pub async fn open(url: impl IntoUrl, transport: Arc<dyn Transport>) -> Result<Self> {
        let url = url.into_url()?;

        let resp = transport
            .round_trip(Request::new(Method::HEAD, url.clone()))
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Head {
                url: url.to_string(),
                status,
            });
        }

        let meta = Metadata::from_headers(resp.headers());
        let size = match meta.length {
            Some(n) if n > 0 => n,
            _ => return Err(Error::MissingLength),
        };

        let accept_ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        if !accept_ranges.contains("bytes") {
            return Err(Error::RangesUnsupported);
        }

        debug!(%url, size, "opened remote resource");

        Ok(Self {
            transport,
            url,
            size,
            meta: RwLock::new(meta),
            transferred: AtomicU64::new(0),
        })
    }

    /// Opens `url` with a plain client and no caching layer.
    pub async fn open_with_client(url: impl IntoUrl, client: Client) -> Result<Self> {
        Self::open(url, Arc::new(client)).await
    }

    /// Get the total bytes received from the network.
    ///
    /// Counts bytes actually delivered to callers; usable for bandwidth
    /// statistics.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Checks a response's metadata against the snapshot.
    ///
    /// A declared total length disagreeing with the open-time length is a
    /// hard error. Validator fields set on both sides must match exactly;
    /// fields the snapshot lacked are adopted from this response.
    fn check_metadata(&self, observed: &Metadata) -> Result<()> {
        if let Some(len) = observed.length {
            if len > 0 && len != self.size {
                return Err(Error::LengthChanged {
                    expected: self.size,
                    actual: len,
                });
            }
        }

        let mut snapshot = self.meta.write();
        if !snapshot.equal(observed) {
            return Err(Error::ResourceChanged);
        }
        snapshot.merge(observed);
        Ok(())
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    /// Read data at the specified offset using an HTTP Range request.
    ///
    /// Sends a GET with `Range: bytes=offset-end` (end clamped to the
    /// resource size) and the validator preconditions. Accepts `206` and
    /// `200` (a full-body `200` is truncated to the requested window). A
    /// `412` means the resource changed. A body shorter than requested is
    /// a legitimate short read near the end of the resource.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let end = (offset + buf.len() as u64).min(self.size) - 1;
        let expected = (end - offset + 1) as usize;

        let mut req = Request::new(Method::GET, self.url.clone());
        req.headers_mut()
            .insert(reqwest::header::RANGE, format_range(offset, end));
        self.meta.read().apply_validators(req.headers_mut());

        debug!(url = %self.url, offset, end, "range read");

        let resp = self.transport.round_trip(req).await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
            StatusCode::PRECONDITION_FAILED => return Err(Error::ResourceChanged),
            status => return Err(Error::UnexpectedStatus(status)),
        }

        self.check_metadata(&Metadata::from_headers(resp.headers()))?;

        let body = resp.bytes().await?;
        let n = body.len().min(expected);
        buf[..n].copy_from_slice(&body[..n]);
        self.transferred.fetch_add(n as u64, Ordering::Relaxed);

        Ok(n)
    }

    /// Get the total size of the remote resource.
    ///
    /// Returns the length observed when the resource was opened; it never
    /// changes for the lifetime of the reader.
    fn size(&self) -> u64 {
        self.size
    }
}
