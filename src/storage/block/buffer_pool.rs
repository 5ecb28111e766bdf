// Copyright 2024 Strata Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// How many idle buffers one size class retains.
const MAX_POOLED_PER_SIZE: usize = 64;

/// Reusable byte-buffer arena keyed by required size.
///
/// Read paths draw their decompression buffers from here; the returned
/// [`PoolBuffer`] guard gives capacity back on every exit path, including
/// error paths. A guard that is leaked costs pool capacity, never
/// correctness.
pub struct BufferPool {
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(HashMap::new()),
        })
    }

    /// A zeroed buffer of exactly `size` bytes.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PoolBuffer {
        let reused = self.free.lock().get_mut(&size).and_then(|bucket| bucket.pop());
        let data = match reused {
            Some(mut data) => {
                data.iter_mut().for_each(|b| *b = 0);
                data
            }
            None => vec![0u8; size],
        };
        PoolBuffer {
            data: Some(data),
            pool: self.clone(),
        }
    }

    fn release(&self, data: Vec<u8>) {
        let mut free = self.free.lock();
        let bucket = free.entry(data.len()).or_default();
        if bucket.len() < MAX_POOLED_PER_SIZE {
            bucket.push(data);
        }
    }

    #[cfg(test)]
    fn pooled(&self, size: usize) -> usize {
        self.free.lock().get(&size).map_or(0, |b| b.len())
    }
}

/// Scoped handle to one pooled buffer.
pub struct PoolBuffer {
    data: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_ref().unwrap()
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().unwrap()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}
