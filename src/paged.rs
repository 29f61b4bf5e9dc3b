//! Demand-paged memory view of a remote resource (Linux only).
//!
//! [`PagedView`] maps the whole resource into anonymous virtual memory
//! and registers the region with `userfaultfd`. Touching an unmapped page
//! traps into a dedicated fault-handler thread, which reads the
//! corresponding page through a [`ReadAt`] source and installs it, so
//! plain slice indexing acts as transparent remote I/O.
//!
//! Every first touch of a page costs a synchronous HTTP round-trip, which
//! is slow; a block-cached reader absorbs repeated access to the same
//! region. The fault handler bridges into the async reader with a
//! captured runtime handle, so a view must be created inside a tokio
//! runtime, and the mapping must not be touched from a runtime worker
//! thread, which would block the very executor the handler needs.

use std::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use memmap2::MmapMut;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error};
use userfaultfd::{Event, Uffd, UffdBuilder};

use crate::error::{Error, Result};
use crate::reader::ReadAt;

/// How often the fault loop wakes to check the shutdown flag.
const POLL_INTERVAL_MS: u16 = 250;

/// A remote resource mapped into memory, paged in on demand.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// # async fn example() -> httpfile::Result<()> {
/// let file = httpfile::open("https://example.com/disk.img").await?;
/// let view = httpfile::PagedView::map(Arc::new(file))?;
///
/// // Indexing faults the page in over HTTP behind the scenes.
/// let magic = &view.bytes()[510..512];
/// assert_eq!(magic, &[0x55, 0xAA]);
/// # Ok(())
/// # }
/// ```
pub struct PagedView {
    /// Full page-aligned region; the resource occupies the prefix.
    map: Option<MmapMut>,
    /// Logical resource size; `bytes()` exposes exactly this many bytes.
    size: usize,
    /// Region length: `size` rounded up to the page.
    mapped_len: usize,
    page_size: usize,
    uffd: Option<Arc<Uffd>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    /// Cursor for sequential `read`.
    cursor: Mutex<usize>,
}

impl PagedView {
    /// Maps `reader`'s full contents into anonymous memory and starts the
    /// page-fault handler.
    ///
    /// Must be called from within a tokio runtime; the handler thread
    /// uses the runtime to drive reads.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMapping`] outside a runtime or for an empty
    /// resource; [`Error::Io`] when the mapping or the userfaultfd
    /// facility cannot be set up (the facility may require privileges,
    /// see `vm.unprivileged_userfaultfd`).
    pub fn map<R: ReadAt + 'static>(reader: Arc<R>) -> Result<PagedView> {
        let handle = Handle::try_current().map_err(|_| Error::InvalidMapping {
            reason: "no tokio runtime on this thread".into(),
        })?;

        let resource_len = reader.size();
        let size = usize::try_from(resource_len).map_err(|_| Error::InvalidMapping {
            reason: format!("resource of {resource_len} bytes exceeds the address space"),
        })?;
        if size == 0 {
            return Err(Error::InvalidMapping {
                reason: "resource is empty".into(),
            });
        }

        let page_size = page_size();
        let mapped_len = size.div_ceil(page_size) * page_size;
        let mut map = MmapMut::map_anon(mapped_len)?;

        let uffd = UffdBuilder::new()
            .close_on_exec(true)
            .non_blocking(true)
            .user_mode_only(true)
            .create()
            .map_err(io::Error::other)?;
        uffd.register(map.as_mut_ptr() as *mut c_void, mapped_len)
            .map_err(io::Error::other)?;

        let uffd = Arc::new(uffd);
        let shutdown = Arc::new(AtomicBool::new(false));
        let base = map.as_ptr() as usize;

        let worker = std::thread::Builder::new()
            .name("httpfile-pagefault".into())
            .spawn({
                let uffd = Arc::clone(&uffd);
                let shutdown = Arc::clone(&shutdown);
                let reader: Arc<dyn ReadAt> = reader;
                move || {
                    fault_loop(FaultLoop {
                        uffd,
                        reader,
                        handle,
                        shutdown,
                        base,
                        mapped_len,
                        page_size,
                        resource_len,
                    })
                }
            })
            .map_err(Error::Io)?;

        debug!(size, mapped_len, page_size, "mapped remote resource");

        Ok(PagedView {
            map: Some(map),
            size,
            mapped_len,
            page_size,
            uffd: Some(uffd),
            shutdown,
            worker: Some(worker),
            cursor: Mutex::new(0),
        })
    }

    /// The resource contents, backed by the mapping.
    ///
    /// The slice is exactly [`size`](Self::size) bytes long; indexing it
    /// triggers HTTP traffic lazily.
    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..self.size],
            None => &[],
        }
    }

    /// Reads sequentially through an internal cursor.
    ///
    /// Returns the number of bytes copied: `0` at or past the end, the
    /// short remainder on the terminal read.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut cursor = self.cursor.lock();
        let data = self.bytes();
        if *cursor >= data.len() || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min(data.len() - *cursor);
        buf[..n].copy_from_slice(&data[*cursor..*cursor + n]);
        *cursor += n;
        n
    }

    /// Logical size of the resource in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Page size the mapping and the fault handler operate on.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Stops the fault handler, unregisters the region, closes the
    /// userfaultfd handle, and unmaps.
    ///
    /// Unregister and close failures are swallowed; all access to
    /// [`bytes`](Self::bytes) must have ceased. Dropping the view
    /// performs the same teardown.
    pub fn close(mut self) -> io::Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let (Some(uffd), Some(map)) = (self.uffd.as_ref(), self.map.as_mut()) {
            let _ = uffd.unregister(map.as_mut_ptr() as *mut c_void, self.mapped_len);
        }
        // Dropping the last handle closes the fd; dropping the map unmaps.
        self.uffd = None;
        self.map = None;
    }
}

impl Drop for PagedView {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct FaultLoop {
    uffd: Arc<Uffd>,
    reader: Arc<dyn ReadAt>,
    handle: Handle,
    shutdown: Arc<AtomicBool>,
    base: usize,
    mapped_len: usize,
    page_size: usize,
    resource_len: u64,
}

/// Services page faults until the shutdown flag fires.
///
/// Runs on its own OS thread: the fault source is a file descriptor that
/// is polled with a timeout so shutdown is observed even when no faults
/// arrive.
fn fault_loop(ctx: FaultLoop) {
    let mut page = vec![0u8; ctx.page_size];

    loop {
        if ctx.shutdown.load(Ordering::Acquire) {
            return;
        }

        let fd = unsafe { BorrowedFd::borrow_raw(ctx.uffd.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => {
                if ctx.shutdown.load(Ordering::Acquire) {
                    return;
                }
                error!(%errno, "polling the fault descriptor failed");
                continue;
            }
        }

        let event = match ctx.uffd.read_event() {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                if ctx.shutdown.load(Ordering::Acquire) {
                    return;
                }
                error!(error = %e, "reading fault event failed");
                continue;
            }
        };

        let addr = match event {
            Event::Pagefault { addr, .. } => addr as usize,
            _ => {
                error!("unexpected event from the fault descriptor");
                continue;
            }
        };

        let page_addr = addr & !(ctx.page_size - 1);
        if page_addr < ctx.base || page_addr >= ctx.base + ctx.mapped_len {
            error!(addr, "page fault outside the mapped region");
            continue;
        }
        let offset = (page_addr - ctx.base) as u64;

        // Offsets past the resource length stay zero-filled: those are
        // the alignment tail of the final page.
        page.fill(0);
        if offset < ctx.resource_len {
            let want = ctx.page_size.min((ctx.resource_len - offset) as usize);
            fill_page(&ctx, offset, &mut page[..want]);
        }

        // One page-aligned copy installs the page and wakes the faulter.
        if let Err(e) = unsafe {
            ctx.uffd.copy(
                page.as_ptr() as *const c_void,
                page_addr as *mut c_void,
                ctx.page_size,
                true,
            )
        } {
            // A racing install (EEXIST) already resolved the fault; make
            // sure the faulting thread is not left parked either way.
            error!(error = %e, offset, "installing page failed");
            let _ = ctx.uffd.wake(page_addr as *mut c_void, ctx.page_size);
        }
    }
}

/// Fills `buf` from the reader at `offset`, retrying short reads.
///
/// `Ok(0)` means EOF and terminates the loop; a short page at the end
/// of the resource is legitimate. Read errors are logged and leave the
/// remainder zeroed; the page is still installed so the faulting thread
/// never hangs on a transient network failure.
fn fill_page(ctx: &FaultLoop, offset: u64, buf: &mut [u8]) {
    let mut filled = 0;
    while filled < buf.len() {
        match ctx
            .handle
            .block_on(ctx.reader.read_at(offset + filled as u64, &mut buf[filled..]))
        {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                error!(error = %e, offset, "page read failed");
                break;
            }
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// In-memory ReadAt source so the paged view can be exercised
    /// without a server.
    struct SliceReader(Vec<u8>);

    #[async_trait]
    impl ReadAt for SliceReader {
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::Result<usize> {
            let data = &self.0;
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        fn size(&self) -> u64 {
            self.0.len() as u64
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// userfaultfd needs kernel support and, depending on
    /// `vm.unprivileged_userfaultfd`, privileges; absence is an
    /// environment limitation, not a failure.
    macro_rules! view_or_skip {
        ($reader:expr) => {
            match PagedView::map($reader) {
                Ok(view) => view,
                Err(e) => {
                    eprintln!("skipping: userfaultfd unavailable: {e}");
                    return;
                }
            }
        };
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn faults_pages_in_on_index() {
        let data = patterned(10_000);
        let view = view_or_skip!(Arc::new(SliceReader(data.clone())));

        assert_eq!(view.size(), data.len());
        let bytes = view.bytes();
        // Touch both ends first so at least two separate faults resolve.
        assert_eq!(bytes[9_999], data[9_999]);
        assert_eq!(bytes[0], data[0]);
        assert_eq!(bytes, &data[..]);

        view.close().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sequential_read_with_cursor() {
        let data = patterned(5_000);
        let view = view_or_skip!(Arc::new(SliceReader(data.clone())));

        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = view.read(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);

        // Terminal state: the cursor stays at the end.
        assert_eq!(view.read(&mut buf), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_without_close_tears_down() {
        let view = view_or_skip!(Arc::new(SliceReader(patterned(100))));
        let first = view.bytes()[0];
        assert_eq!(first, 0);
        drop(view);
    }

    #[tokio::test]
    async fn rejects_empty_resource() {
        let err = PagedView::map(Arc::new(SliceReader(Vec::new()))).unwrap_err();
        assert!(matches!(err, Error::InvalidMapping { .. }));
    }
}
