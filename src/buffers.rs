//! A bounded pool of chunk-sized scratch buffers.

use log::warn;

#[derive(Debug)]
pub struct BufferPool {
    chunk_size: usize,
    capacity: usize,
    free: Vec<Vec<u8>>,
    outstanding: usize,
    overflows: u64,
}

impl BufferPool {
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            chunk_size,
            capacity,
            free: (0..capacity).map(|_| vec![0; chunk_size]).collect(),
            outstanding: 0,
            overflows: 0,
        }
    }

    /// Take a buffer; when the pool is exhausted a fresh one is allocated and a warning logged
    pub fn acquire(&mut self) -> Vec<u8> {
        self.outstanding += 1;
        match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.overflows += 1;
                warn!(
                    "all {} scratch buffers in use, allocating another",
                    self.capacity
                );
                vec![0; self.chunk_size]
            }
        }
    }

    /// Give a buffer back
    pub fn release(&mut self, mut buffer: Vec<u8>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.capacity && buffer.len() == self.chunk_size {
            buffer.fill(0);
            self.free.push(buffer);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Number of times a buffer had to be allocated past the pool's capacity
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

#[test]
fn test_pool_bounds() {
    let mut pool = BufferPool::new(512, 2);
    let a = pool.acquire();
    let b = pool.acquire();
    let c = pool.acquire();
    assert_eq!(pool.outstanding(), 3);
    assert_eq!(pool.overflows(), 1);
    assert_eq!(c.len(), 512);

    pool.release(a);
    pool.release(b);
    pool.release(c);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.free.len(), 2);
}
