use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use super::BlockCache;

/// In-memory block cache: a hash map behind one mutex.
///
/// Values are reference-counted, so `get` hands out cheap clones of the
/// stored bytes without copying.
#[derive(Debug, Default)]
pub struct MemoryBlockCache {
    blocks: Mutex<HashMap<u64, Bytes>>,
}

impl MemoryBlockCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockCache for MemoryBlockCache {
    fn get(&self, index: u64) -> Option<Bytes> {
        self.blocks.lock().get(&index).cloned()
    }

    fn put(&self, index: u64, data: &[u8]) {
        self.blocks.lock().insert(index, Bytes::copy_from_slice(data));
    }

    fn delete(&self, index: u64) {
        self.blocks.lock().remove(&index);
    }

    fn clear(&self) {
        self.blocks.lock().clear();
    }
}
