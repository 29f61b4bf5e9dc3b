//! # httpfile
//!
//! Random-access, seekable reads over remote HTTP resources.
//!
//! This library turns a URL into something that behaves like a local
//! file: positional reads, a seek cursor, and (on Linux) a demand-paged
//! memory view. Reads become HTTP Range requests; a block-aligned caching
//! transport deduplicates and stores fetched blocks so repeated and
//! overlapping reads touch the network once.
//!
//! ## Features
//!
//! - Positional reads (`read_at`) translated to `Range: bytes=..` GETs
//! - Seekable, file-like view with an independent cursor
//! - Block-aligned response caching with in-flight request deduplication
//! - Remote-change detection via `If-Match` / `If-Unmodified-Since`
//! - Pluggable block caches: in-memory map or one anonymous mmap region
//! - Demand paging: map the resource into memory and fault pages in over
//!   HTTP (Linux, `userfaultfd`)
//!
//! ## Example
//!
//! ```no_run
//! use std::io::SeekFrom;
//!
//! #[tokio::main]
//! async fn main() -> httpfile::Result<()> {
//!     // One call wires client, block cache, and reader together.
//!     let file = httpfile::open("https://example.com/large.iso").await?;
//!     println!("size: {} bytes", file.size());
//!
//!     let mut buf = [0u8; 16];
//!     file.seek(SeekFrom::Start(512)).await?;
//!     let n = file.read(&mut buf).await?;
//!     println!("bytes [512..528): {:?}", &buf[..n]);
//!     Ok(())
//! }
//! ```

mod cache;
mod error;
mod file;
mod meta;
mod reader;
mod transport;

#[cfg(target_os = "linux")]
mod paged;

pub use cache::{BlockCache, MemoryBlockCache, MmapBlockCache};
pub use error::{Error, Result};
pub use file::HttpFile;
pub use meta::Metadata;
pub use reader::{HttpRangeReader, ReadAt};
pub use transport::{BlockCacheTransport, Transport, DEFAULT_BLOCK_SIZE};

#[cfg(target_os = "linux")]
pub use paged::PagedView;

use std::sync::Arc;

use reqwest::{Client, IntoUrl};

/// Opens a remote HTTP resource as a seekable file.
///
/// Equivalent to wiring the pieces by hand: a fresh [`reqwest::Client`]
/// wrapped in a [`BlockCacheTransport`] over a [`MemoryBlockCache`] with
/// the default block size, feeding an [`HttpRangeReader`] exposed as an
/// [`HttpFile`]. Use the individual types to customize any layer.
pub async fn open(url: impl IntoUrl) -> Result<HttpFile> {
    let transport = Arc::new(BlockCacheTransport::new(
        Arc::new(Client::new()),
        Some(Arc::new(MemoryBlockCache::new())),
    ));
    let reader = HttpRangeReader::open(url, transport).await?;
    Ok(HttpFile::new(Arc::new(reader)))
}
