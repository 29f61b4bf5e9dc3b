//! Block cache backed by one anonymous memory mapping.
//!
//! All block slots live in a single `mmap`'d region instead of individual
//! heap allocations, which keeps large working sets from fragmenting the
//! heap. A validity bitmap marks which slots hold data; the region is
//! unmapped when the cache is dropped.

use std::io;

use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::RwLock;

use super::BlockCache;

/// One bit per block, packed into u64 words.
#[derive(Debug)]
struct Bitset {
    words: Vec<u64>,
}

impl Bitset {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    fn set(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    fn clear(&mut self, i: usize) {
        self.words[i / 64] &= !(1 << (i % 64));
    }

    fn get(&self, i: usize) -> bool {
        (self.words[i / 64] >> (i % 64)) & 1 != 0
    }

    fn reset(&mut self) {
        self.words.fill(0);
    }
}

struct Slots {
    map: MmapMut,
    valid: Bitset,
}

/// Mmap-backed block cache with validity tracking.
///
/// The region holds exactly `total_size` bytes, carved into
/// `total_size / block_size` fixed slots. `put` zero-fills the tail of a
/// short payload so a slot never exposes stale bytes. Readers and writers
/// are separated by a reader-writer lock.
pub struct MmapBlockCache {
    slots: RwLock<Slots>,
    block_size: u64,
    num_blocks: u64,
}

impl MmapBlockCache {
    /// Maps an anonymous region of `total_size` bytes split into
    /// `block_size`-sized slots.
    ///
    /// `total_size` must be a positive multiple of `block_size`.
    pub fn new(total_size: u64, block_size: u64) -> io::Result<Self> {
        if block_size == 0 || total_size == 0 || total_size % block_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cache sizes: total={total_size} block={block_size}"),
            ));
        }
        let num_blocks = total_size / block_size;
        let map = MmapMut::map_anon(total_size as usize)?;

        Ok(Self {
            slots: RwLock::new(Slots {
                map,
                valid: Bitset::new(num_blocks as usize),
            }),
            block_size,
            num_blocks,
        })
    }

    /// Unmaps the region. Dropping the cache has the same effect.
    pub fn close(self) {}

    /// Total mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.num_blocks * self.block_size
    }

    /// Size of one block slot in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of block slots in the region.
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn slot_range(&self, index: u64) -> std::ops::Range<usize> {
        let start = (index * self.block_size) as usize;
        start..start + self.block_size as usize
    }
}

impl BlockCache for MmapBlockCache {
    fn get(&self, index: u64) -> Option<Bytes> {
        if index >= self.num_blocks {
            return None;
        }
        let slots = self.slots.read();
        if !slots.valid.get(index as usize) {
            return None;
        }
        // The trait cannot hand out a borrow tied to the lock guard, so the
        // slot is copied out. One block is small; the win of this cache is
        // where the blocks live, not zero-copy reads.
        Some(Bytes::copy_from_slice(&slots.map[self.slot_range(index)]))
    }

    fn put(&self, index: u64, data: &[u8]) {
        if index >= self.num_blocks {
            return;
        }
        let range = self.slot_range(index);
        let len = data.len().min(self.block_size as usize);

        let mut slots = self.slots.write();
        let Slots { map, valid } = &mut *slots;
        let slot = &mut map[range];
        slot[..len].copy_from_slice(&data[..len]);
        slot[len..].fill(0);
        valid.set(index as usize);
    }

    fn delete(&self, index: u64) {
        if index >= self.num_blocks {
            return;
        }
        let range = self.slot_range(index);
        let mut slots = self.slots.write();
        slots.valid.clear(index as usize);
        slots.map[range].fill(0);
    }

    fn clear(&self) {
        let mut slots = self.slots.write();
        slots.valid.reset();
        slots.map.fill(0);
    }
}
