// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound buffer pool and per-connection send queue.
//!
//! Each I/O processor owns one [`BufferPool`] of fixed-size buffers bounded by
//! its share of the pool budget. When the pool is exhausted, [`BufferPool::get`]
//! still returns a buffer, heap-allocated and flagged as forced; the caller
//! reacts by suspending the connection.
//!
//! # Performance
//!
//! - get/put: lock-free (crossbeam `ArrayQueue` freelist)
//! - Buffers are allocated lazily up to the pool capacity

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;

// ============================================================================
// Outbound buffer
// ============================================================================

/// Byte buffer with a read cursor.
///
/// Data is appended at the end and consumed from the cursor.
#[derive(Debug)]
pub struct OutBuffer {
    data: Vec<u8>,
    read: usize,
    pooled: bool,
}

impl OutBuffer {
    fn new(capacity: usize, pooled: bool) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read: 0,
            pooled,
        }
    }

    /// Unconsumed bytes.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.read..]
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.read
    }

    /// Whether every byte was consumed.
    pub fn is_empty(&self) -> bool {
        self.read >= self.data.len()
    }

    /// Free space at the end.
    pub fn space(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    /// Whether the buffer returns to the pool on release.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Append up to `space()` bytes; returns how many were taken.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Advance the read cursor.
    pub fn consume(&mut self, n: usize) {
        self.read = (self.read + n).min(self.data.len());
    }

    fn reset(&mut self) {
        self.data.clear();
        self.read = 0;
    }
}

// ============================================================================
// Buffer pool
// ============================================================================

/// Bounded pool of outbound buffers.
#[derive(Debug)]
pub struct BufferPool {
    /// Released buffers ready for reuse
    free: ArrayQueue<OutBuffer>,
    /// Size of every buffer
    buffer_size: usize,
    /// Maximum pooled buffers
    capacity: usize,
    /// Pooled buffers created so far
    allocated: AtomicUsize,
    /// Count of heap allocations made because the pool was empty
    forced: AtomicU64,
}

impl BufferPool {
    /// Create a pool of `buffer_size` buffers within `budget_bytes`.
    pub fn new(buffer_size: usize, budget_bytes: u64) -> Self {
        let capacity = usize::try_from(budget_bytes / buffer_size.max(1) as u64)
            .unwrap_or(usize::MAX)
            .clamp(1, 1 << 20);
        Self {
            free: ArrayQueue::new(capacity),
            buffer_size,
            capacity,
            allocated: AtomicUsize::new(0),
            forced: AtomicU64::new(0),
        }
    }

    /// Take a buffer. The flag is `true` when the pool was exhausted.
    pub fn get(&self) -> (OutBuffer, bool) {
        if let Some(buf) = self.free.pop() {
            return (buf, false);
        }
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if reserved {
            (OutBuffer::new(self.buffer_size, true), false)
        } else {
            self.forced.fetch_add(1, Ordering::Relaxed);
            (OutBuffer::new(self.buffer_size, false), true)
        }
    }

    /// Return a buffer. Forced buffers are simply dropped.
    pub fn put(&self, mut buf: OutBuffer) {
        if !buf.pooled {
            return;
        }
        buf.reset();
        if self.free.push(buf).is_err() {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Size of each buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum pooled buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers in the freelist.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Pooled buffers handed out and not yet returned.
    pub fn in_use(&self) -> usize {
        self.allocated
            .load(Ordering::Acquire)
            .saturating_sub(self.free.len())
    }

    /// Heap allocations made while exhausted.
    pub fn forced_count(&self) -> u64 {
        self.forced.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Send queue
// ============================================================================

/// Ordered chain of outbound buffers of one connection.
///
/// Appends go to the tail buffer while it has room, then to fresh buffers.
/// The head is popped by the I/O processor, which keeps a single buffer in
/// flight at a time.
#[derive(Debug, Default)]
pub struct SendQueue {
    bufs: VecDeque<OutBuffer>,
    bytes: usize,
}

impl SendQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `parts` in order. Returns `true` if any forced allocation happened.
    pub fn append(&mut self, pool: &BufferPool, parts: &[&[u8]]) -> bool {
        let mut forced = false;
        for part in parts {
            let mut rest = *part;
            while !rest.is_empty() {
                let tail_has_room = self.bufs.back().is_some_and(|b| b.space() > 0);
                if !tail_has_room {
                    let (buf, was_forced) = pool.get();
                    forced |= was_forced;
                    self.bufs.push_back(buf);
                }
                if let Some(tail) = self.bufs.back_mut() {
                    let n = tail.fill(rest);
                    rest = &rest[n..];
                    self.bytes += n;
                }
            }
        }
        forced
    }

    /// Remove the head buffer.
    pub fn pop_front(&mut self) -> Option<OutBuffer> {
        let buf = self.bufs.pop_front()?;
        self.bytes -= buf.len();
        Some(buf)
    }

    /// Queued buffer count.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Queued byte count.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Return every queued buffer to `pool`.
    pub fn release(&mut self, pool: &BufferPool) {
        while let Some(buf) = self.bufs.pop_front() {
            pool.put(buf);
        }
        self.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_capacity_from_budget() {
        let pool = BufferPool::new(1024, 8 * 1024);
        assert_eq!(pool.capacity(), 8);
        let pool = BufferPool::new(1024, 10);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_pool_forced_when_exhausted() {
        let pool = BufferPool::new(512, 1024);
        let (a, fa) = pool.get();
        let (b, fb) = pool.get();
        let (c, fc) = pool.get();
        assert!(!fa && !fb);
        assert!(fc);
        assert!(!c.is_pooled());
        assert_eq!(pool.forced_count(), 1);
        assert_eq!(pool.in_use(), 2);

        pool.put(a);
        pool.put(c);
        assert_eq!(pool.available(), 1);
        let (_, forced) = pool.get();
        assert!(!forced);
        pool.put(b);
    }

    #[test]
    fn test_buffer_cursor() {
        let pool = BufferPool::new(512, 4096);
        let (mut buf, _) = pool.get();
        assert_eq!(buf.fill(b"hello"), 5);
        buf.consume(2);
        assert_eq!(buf.pending(), b"llo");
        buf.consume(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_queue_appends_to_tail() {
        let pool = BufferPool::new(512, 64 * 1024);
        let mut q = SendQueue::new();
        assert!(!q.append(&pool, &[b"ab", b"cd"]));
        assert!(!q.append(&pool, &[b"ef"]));
        assert_eq!(q.len(), 1);
        assert_eq!(q.bytes(), 6);
        let head = q.pop_front().unwrap();
        assert_eq!(head.pending(), b"abcdef");
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_spans_buffers_in_order() {
        let pool = BufferPool::new(512, 64 * 1024);
        let mut q = SendQueue::new();
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        q.append(&pool, &[&payload]);
        assert_eq!(q.len(), 3);

        let mut out = Vec::new();
        while let Some(buf) = q.pop_front() {
            out.extend_from_slice(buf.pending());
            pool.put(buf);
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn test_queue_reports_forced() {
        let pool = BufferPool::new(512, 512);
        let mut q = SendQueue::new();
        let big = vec![7u8; 1024];
        assert!(q.append(&pool, &[&big]));
        q.release(&pool);
        assert_eq!(q.bytes(), 0);
        assert_eq!(pool.available(), 1);
    }
}
