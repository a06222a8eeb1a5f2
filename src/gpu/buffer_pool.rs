use std::collections::HashMap;
use std::sync::Arc;

use wgpu::BufferUsages;

/// A shareable reference to a GPU buffer.
pub type GpuBuf = Arc<wgpu::Buffer>;

const SIZE_ROUND: u64 = 256;

fn round_size(size: u64) -> u64 {
    let size = size.max(4);
    let rounded = size.div_ceil(SIZE_ROUND) * SIZE_ROUND;
    rounded.next_power_of_two()
}

/// Key identifying a size/usage bucket. Buffers are never downsized, so a
/// bucket only ever serves requests whose rounded size matches exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BucketKey {
    size_class: u64,
    usage: u64,
}

struct PoolEntry {
    buffer: GpuBuf,
    in_use: bool,
}

/// Size-bucketed GPU buffer pool.
///
/// Buckets are keyed by `(usage_flags, next_power_of_two(round_up(size, 256)))`.
/// `acquire` pops a free entry from the matching bucket or allocates a new
/// buffer at the bucket's size class; `release` marks the entry free again.
/// Buffers are reused across forward passes instead of being freed every
/// dispatch sequence, which is the entire point of having a pool.
pub struct BufferPool {
    device: Arc<wgpu::Device>,
    buckets: HashMap<BucketKey, Vec<PoolEntry>>,
}

impl BufferPool {
    pub fn new(device: Arc<wgpu::Device>) -> Self {
        Self {
            device,
            buckets: HashMap::new(),
        }
    }

    /// Acquire a buffer of at least `size` bytes with the given usage flags.
    /// Reuses a released buffer from the matching bucket when one is free.
    pub fn acquire(&mut self, size: u64, usage: BufferUsages) -> GpuBuf {
        let key = BucketKey {
            size_class: round_size(size),
            usage: usage.bits(),
        };
        let bucket = self.buckets.entry(key).or_default();

        if let Some(entry) = bucket.iter_mut().find(|e| !e.in_use) {
            entry.in_use = true;
            return Arc::clone(&entry.buffer);
        }

        let buffer = Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: key.size_class,
            usage,
            mapped_at_creation: false,
        }));
        bucket.push(PoolEntry {
            buffer: Arc::clone(&buffer),
            in_use: true,
        });
        buffer
    }

    /// Release a buffer back to its bucket. Identified by pointer identity,
    /// not by value equality, so a double-release of the same `Arc` is a
    /// silent no-op rather than corrupting the free stack.
    pub fn release(&mut self, buffer: GpuBuf) {
        for bucket in self.buckets.values_mut() {
            for entry in bucket.iter_mut() {
                if Arc::ptr_eq(&entry.buffer, &buffer) {
                    entry.in_use = false;
                    return;
                }
            }
        }
    }

    /// Destroy every currently-free buffer, keeping in-use ones and their
    /// bucket slots intact.
    pub fn trim(&mut self) {
        for bucket in self.buckets.values_mut() {
            for entry in bucket.iter() {
                if !entry.in_use {
                    entry.buffer.destroy();
                }
            }
            bucket.retain(|e| e.in_use);
        }
    }

    /// Destroy every buffer the pool owns, in use or not, and forget all
    /// buckets. Called at model dispose.
    pub fn destroy(&mut self) {
        for bucket in self.buckets.values() {
            for entry in bucket {
                entry.buffer.destroy();
            }
        }
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_size_rounds_up_to_256_then_next_pow2() {
        assert_eq!(round_size(1), 256);
        assert_eq!(round_size(256), 256);
        assert_eq!(round_size(257), 512);
        assert_eq!(round_size(300), 512);
        assert_eq!(round_size(1024), 1024);
        assert_eq!(round_size(1025), 2048);
    }
}
