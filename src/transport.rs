//! Block-aligned caching of HTTP Range requests.
//!
//! [`BlockCacheTransport`] sits between the reader and the real HTTP
//! client the way a middleware does: it rewrites incoming `Range` requests
//! to fixed-size aligned blocks, fetches missing blocks from the origin in
//! one coalesced request, stores them in a [`BlockCache`], and answers the
//! caller with a synthesized `206 Partial Content` carrying exactly the
//! originally requested sub-range.
//!
//! Concurrent requests that need the same leading block share a single
//! origin fetch: one caller leads, the rest wait and then re-read the
//! cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, Request, Response, StatusCode};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::BlockCache;
use crate::error::{Error, Result};

/// Block alignment used when none is configured.
pub const DEFAULT_BLOCK_SIZE: u64 = 512;

/// A single HTTP round-trip: the seam the caching layer wraps.
///
/// [`reqwest::Client`] implements this by plain execution, and
/// [`BlockCacheTransport`] implements it by caching, so transports nest
/// the way HTTP middlewares do.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for Client {
    async fn round_trip(&self, req: Request) -> Result<Response> {
        Ok(self.execute(req).await?)
    }
}

/// Caching transport that rounds `Range` requests to block boundaries.
///
/// Requests it cannot cache (non-GET methods, requests without a `Range`
/// header, malformed ranges, or a transport configured without a cache)
/// are forwarded to the inner transport verbatim.
///
/// Cache keys are bare block indices, so one `BlockCacheTransport` (and
/// its cache) serves a single remote resource.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use httpfile::{BlockCacheTransport, HttpRangeReader, MemoryBlockCache};
///
/// # async fn example() -> httpfile::Result<()> {
/// let transport = Arc::new(BlockCacheTransport::new(
///     Arc::new(reqwest::Client::new()),
///     Some(Arc::new(MemoryBlockCache::new())),
/// ));
/// let reader = HttpRangeReader::open("https://example.com/large.bin", transport).await?;
/// # Ok(())
/// # }
/// ```
pub struct BlockCacheTransport {
    /// Transport the origin fetches go through.
    inner: Arc<dyn Transport>,
    /// Block store; `None` disables caching entirely.
    cache: Option<Arc<dyn BlockCache>>,
    /// Alignment of origin fetches, in bytes.
    block_size: u64,
    /// Fetches in progress, keyed by their first missing block index.
    /// Joiners hold the receiver; the sender lives in the leader's guard
    /// and its drop is the completion signal.
    in_flight: Mutex<HashMap<u64, watch::Receiver<()>>>,
}

impl BlockCacheTransport {
    /// Wraps `inner` with block-aligned caching into `cache`.
    pub fn new(inner: Arc<dyn Transport>, cache: Option<Arc<dyn BlockCache>>) -> Self {
        Self {
            inner,
            cache,
            block_size: DEFAULT_BLOCK_SIZE,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the block alignment; zero keeps the default.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        if block_size > 0 {
            self.block_size = block_size;
        }
        self
    }

    /// Fetches the coalesced aligned range covering `missing` and stores
    /// the resulting blocks.
    ///
    /// `missing` is non-empty and sorted. The cache is written only after
    /// the full body arrived, so a mid-body failure caches nothing.
    async fn fetch_blocks(
        &self,
        fetch_req: Request,
        cache: &dyn BlockCache,
        missing: &[u64],
    ) -> Result<()> {
        let bs = self.block_size;
        let first_miss = missing[0];
        let last_miss = missing[missing.len() - 1];
        let range_start = first_miss * bs;
        let range_end = (last_miss + 1) * bs - 1;

        let mut fetch_req = fetch_req;
        fetch_req
            .headers_mut()
            .insert(RANGE, format_range(range_start, range_end));

        debug!(
            url = %fetch_req.url(),
            range_start,
            range_end,
            "fetching aligned range from origin"
        );

        let resp = self.inner.round_trip(fetch_req).await?;
        let status = resp.status();
        // A 200 body starts at byte zero regardless of the Range header,
        // so its chunks land at the absolute block indices.
        let base_index = match status {
            StatusCode::PARTIAL_CONTENT => first_miss,
            StatusCode::OK => 0,
            StatusCode::PRECONDITION_FAILED => {
                for &index in missing {
                    cache.delete(index);
                }
                return Err(Error::ResourceChanged);
            }
            status => return Err(Error::UnexpectedStatus(status)),
        };

        let body = resp.bytes().await?;
        for (i, chunk) in body.chunks(bs as usize).enumerate() {
            cache.put(base_index + i as u64, chunk);
        }
        Ok(())
    }

    /// Concatenates the cached blocks `first..=last` and slices out the
    /// caller's `[start..=end]` sub-range.
    ///
    /// Blocks can be absent past end-of-resource; assembly stops at the
    /// first gap and the slice is clamped to what exists.
    fn assemble(&self, cache: &dyn BlockCache, first: u64, last: u64, start: u64, end: u64) -> Bytes {
        let bs = self.block_size;
        let mut combined = Vec::with_capacity(((last - first + 1) * bs) as usize);
        for index in first..=last {
            match cache.get(index) {
                Some(block) => combined.extend_from_slice(&block),
                None => break,
            }
        }

        let offset = (start - first * bs) as usize;
        let len = (end - start + 1) as usize;
        if offset >= combined.len() {
            return Bytes::new();
        }
        let stop = (offset + len).min(combined.len());
        Bytes::from(combined).slice(offset..stop)
    }
}

#[async_trait]
impl Transport for BlockCacheTransport {
    async fn round_trip(&self, req: Request) -> Result<Response> {
        let Some(cache) = self.cache.clone() else {
            return self.inner.round_trip(req).await;
        };
        if req.method() != Method::GET {
            return self.inner.round_trip(req).await;
        }
        let parsed = req
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        let Some((start, requested_end)) = parsed else {
            return self.inner.round_trip(req).await;
        };
        // Streaming bodies cannot be re-sent for the aligned fetch.
        if req.try_clone().is_none() {
            return self.inner.round_trip(req).await;
        }

        let bs = self.block_size;
        let end = match requested_end {
            Some(e) if e >= start => e,
            _ => start + bs - 1,
        };
        let first = start / bs;
        let last = end / bs;

        enum Plan {
            Ready,
            Join(watch::Receiver<()>),
            Lead(watch::Sender<()>, Vec<u64>),
        }

        loop {
            // The miss scan shares the in-flight critical section so two
            // racing requests cannot both miss and both lead.
            let plan = {
                let mut in_flight = self.in_flight.lock();
                let missing: Vec<u64> =
                    (first..=last).filter(|&b| cache.get(b).is_none()).collect();
                match missing.first() {
                    None => Plan::Ready,
                    Some(&key) => match in_flight.get(&key) {
                        Some(rx) => Plan::Join(rx.clone()),
                        None => {
                            let (tx, rx) = watch::channel(());
                            in_flight.insert(key, rx);
                            Plan::Lead(tx, missing)
                        }
                    },
                }
            };

            match plan {
                Plan::Ready => break,
                Plan::Join(mut rx) => {
                    // Wakes when the leader drops its sender, on success
                    // and failure alike; then re-scan the cache.
                    let _ = rx.changed().await;
                }
                Plan::Lead(tx, missing) => {
                    let _release = InFlightGuard {
                        key: missing[0],
                        map: &self.in_flight,
                        _tx: tx,
                    };
                    let fetch_req = match req.try_clone() {
                        Some(r) => r,
                        None => return self.inner.round_trip(req).await,
                    };
                    self.fetch_blocks(fetch_req, cache.as_ref(), &missing).await?;
                    break;
                }
            }
        }

        let body = self.assemble(cache.as_ref(), first, last, start, end);

        let synthesized = http::Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .version(http::Version::HTTP_11)
            .header(CONTENT_RANGE, format!("bytes {start}-{end}/*"))
            .header(CONTENT_LENGTH, body.len())
            .body(body)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(Response::from(synthesized))
    }
}

/// Removes the in-flight entry when the leader finishes; dropping the
/// sender it holds is what releases the joiners.
struct InFlightGuard<'a> {
    key: u64,
    map: &'a Mutex<HashMap<u64, watch::Receiver<()>>>,
    _tx: watch::Sender<()>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}

/// Parses `bytes=<start>-<end>` or the open-ended `bytes=<start>-`.
///
/// Returns `None` for anything else (suffix ranges, multi-ranges, other
/// units), which the transport treats as not cacheable.
fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let rest = header.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim();
    if end.is_empty() {
        return Some((start, None));
    }
    Some((start, Some(end.parse::<u64>().ok()?)))
}

/// `Range`/`Content-Range`-style header value for `bytes=start-end`.
pub(crate) fn format_range(start: u64, end: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes={start}-{end}"))
        .expect("a digits-only range is a valid header value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_range() {
        assert_eq!(parse_range("bytes=0-127"), Some((0, Some(127))));
        assert_eq!(parse_range("bytes=3584-4095"), Some((3584, Some(4095))));
    }

    #[test]
    fn parses_open_range() {
        assert_eq!(parse_range("bytes=512-"), Some((512, None)));
    }

    #[test]
    fn rejects_malformed_ranges() {
        for header in [
            "bytes=-500",
            "bytes=a-b",
            "bytes=5",
            "items=0-10",
            "bytes=0-1,5-9",
            "",
        ] {
            assert_eq!(parse_range(header), None, "header: {header:?}");
        }
    }

    #[test]
    fn format_range_round_trips() {
        let v = format_range(100, 612);
        assert_eq!(parse_range(v.to_str().unwrap()), Some((100, Some(612))));
    }
}
