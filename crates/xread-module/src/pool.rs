//! `SlabPool` — tiered I/O buffer pool with a shared fallback allocator.
//!
//! Each portal owns one `SlabPool`, so acquire/release take `&mut self` and
//! need no locking. Buffers come in five tiers:
//!
//! | Tier | Size   | Cap (default)  |
//! |------|--------|----------------|
//! | 0    | 4 KiB  | queue depth    |
//! | 1    | 32 KiB | queue depth    |
//! | 2    | 64 KiB | queue depth    |
//! | 3    | 128 KiB| 256            |
//! | 4    | 1 MiB  | 32             |
//!
//! Tier buffers are allocated lazily up to the cap and then recycled
//! through a free list. When a tier is exhausted (or the request is larger
//! than 1 MiB) the caller goes to the `FallbackAllocator`, which is shared by
//! every portal and bounded by a byte limit.

use xread_core::buffer::{BufferOrigin, IoBuffer};
use xread_core::error::{Result, XreadError};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub const TIER_SIZES: [usize; 5] = [4 << 10, 32 << 10, 64 << 10, 128 << 10, 1 << 20];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Max buffers per tier, indexed like `TIER_SIZES`.
    pub tier_caps: [usize; 5],
}

impl PoolConfig {
    pub fn for_queue_depth(queue_depth: usize) -> Self {
        Self {
            tier_caps: [queue_depth, queue_depth, queue_depth, 256, 32],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::for_queue_depth(256)
    }
}

/// Process-wide allocator for buffers the slab tiers cannot serve.
pub struct FallbackAllocator {
    limit: usize,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
}

impl FallbackAllocator {
    /// `limit` caps the bytes outstanding across all portals.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            outstanding: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self, size: usize) -> Result<IoBuffer> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(size).filter(|&next| next <= self.limit)
            });
        if reserved.is_err() {
            return Err(XreadError::ResourceExhausted);
        }

        match IoBuffer::alloc(size, BufferOrigin::Fallback) {
            Some(buf) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Ok(buf)
            }
            None => {
                self.outstanding.fetch_sub(size, Ordering::AcqRel);
                Err(XreadError::ResourceExhausted)
            }
        }
    }

    pub fn free(&self, buf: IoBuffer) {
        debug_assert!(!buf.from_pool());
        self.outstanding.fetch_sub(buf.capacity(), Ordering::AcqRel);
        drop(buf);
    }

    /// Bytes currently allocated.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Allocations made since creation.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

struct Tier {
    size: usize,
    cap: usize,
    allocated: usize,
    free: Vec<IoBuffer>,
}

pub struct SlabPool {
    tiers: Vec<Tier>,
    fallback: Arc<FallbackAllocator>,
    in_use: usize,
    fallback_in_use: usize,
}

impl SlabPool {
    pub fn new(config: PoolConfig, fallback: Arc<FallbackAllocator>) -> Self {
        let tiers = TIER_SIZES
            .iter()
            .zip(config.tier_caps.iter())
            .map(|(&size, &cap)| Tier {
                size,
                cap,
                allocated: 0,
                free: Vec::new(),
            })
            .collect();
        Self {
            tiers,
            fallback,
            in_use: 0,
            fallback_in_use: 0,
        }
    }

    /// Smallest tier buffer holding `size` bytes, or `None` if that tier is
    /// exhausted or `size` exceeds the largest tier.
    pub fn acquire(&mut self, size: usize) -> Option<IoBuffer> {
        let idx = self.tiers.iter().position(|t| t.size >= size)?;
        let tier = &mut self.tiers[idx];

        let buf = match tier.free.pop() {
            Some(buf) => buf,
            None if tier.allocated < tier.cap => {
                let buf = IoBuffer::alloc(tier.size, BufferOrigin::Pool { tier: idx as u8 })?;
                tier.allocated += 1;
                buf
            }
            None => return None,
        };
        self.in_use += 1;
        Some(buf)
    }

    /// Ad hoc allocation through the shared fallback allocator.
    pub fn acquire_fallback(&mut self, size: usize) -> Result<IoBuffer> {
        let buf = self.fallback.allocate(size)?;
        self.fallback_in_use += 1;
        Ok(buf)
    }

    /// Release a buffer obtained from this pool. Tier buffers are recycled;
    /// fallback buffers are freed.
    pub fn release(&mut self, mut buf: IoBuffer) {
        match buf.origin() {
            BufferOrigin::Pool { tier } => {
                buf.clear();
                self.in_use -= 1;
                self.tiers[tier as usize].free.push(buf);
            }
            BufferOrigin::Fallback => {
                self.fallback_in_use -= 1;
                self.fallback.free(buf);
            }
        }
    }

    /// Tier buffers handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Fallback buffers handed out and not yet released.
    pub fn fallback_in_use(&self) -> usize {
        self.fallback_in_use
    }

    /// Tier buffers allocated so far (in use plus free).
    pub fn allocated(&self) -> usize {
        self.tiers.iter().map(|t| t.allocated).sum()
    }
}
