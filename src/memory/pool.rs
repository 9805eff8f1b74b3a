//! Fixed-capacity pool of equally sized memory blocks backed by one
//! contiguous arena.
//!
//! RDMA work requests need memory that stays pinned and registered for as
//! long as the NIC may touch it. Registering one contiguous arena exactly
//! once amortizes the registration cost and guarantees that every block
//! handed out is already covered by the pool's local key.

use crate::error::{AxonError, Result};
use crossbeam_queue::ArrayQueue;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::sync::Arc;

/// Message-view header size: a `u32` payload length precedes the payload.
pub const MESSAGE_HEADER_SIZE: usize = 4;

const ARENA_ALIGN: usize = 4096;

struct PoolInner {
    base: *mut u8,
    pool_size: usize,
    block_size: usize,
    free: ArrayQueue<usize>,
    layout: Layout,
}

// Safety: the arena is a plain byte region; the free queue is lock-free and
// each block index is owned by at most one handle at a time.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Thread-safe pool of `2^(pool_bits - block_bits)` blocks of
/// `2^block_bits` bytes each, carved out of a single page-aligned arena.
///
/// [`allocate`](BufferPool::allocate) hands out [`OwnedMemoryBlock`]s;
/// dropping a block returns it to the pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `2^pool_bits` bytes divided into `2^block_bits`-byte
    /// blocks. The arena is allocated zeroed and page-aligned.
    pub fn new(pool_bits: u32, block_bits: u32) -> Self {
        assert!(
            pool_bits >= block_bits,
            "pool ({pool_bits} bits) smaller than one block ({block_bits} bits)"
        );
        let pool_size = 1usize << pool_bits;
        let block_size = 1usize << block_bits;
        let total_blocks = 1usize << (pool_bits - block_bits);

        let layout = Layout::from_size_align(pool_size, ARENA_ALIGN)
            .expect("power-of-two pool layout is always valid");
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }

        let free = ArrayQueue::new(total_blocks);
        for index in 0..total_blocks {
            let _ = free.push(index);
        }

        Self {
            inner: Arc::new(PoolInner {
                base,
                pool_size,
                block_size,
                free,
                layout,
            }),
        }
    }

    /// Take one block out of the pool.
    ///
    /// Fails with [`AxonError::PoolExhausted`] when every block is held by
    /// an outstanding handle; callers decide how to apply backpressure.
    pub fn allocate(&self) -> Result<OwnedMemoryBlock> {
        let index = self
            .inner
            .free
            .pop()
            .ok_or_else(|| AxonError::PoolExhausted {
                total_blocks: self.total_blocks(),
            })?;
        let ptr = unsafe { self.inner.base.add(index * self.inner.block_size) };
        Ok(OwnedMemoryBlock {
            ptr,
            len: self.inner.block_size,
            index,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Start of the arena, for memory registration.
    pub fn base_ptr(&self) -> *mut u8 {
        self.inner.base
    }

    /// Total arena size in bytes.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.inner.pool_size / self.inner.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.total_blocks() - self.free_blocks()
    }
}

/// Exclusive handle to one pool block. Moving the handle transfers the right
/// to release it; dropping it returns the block to the pool.
pub struct OwnedMemoryBlock {
    ptr: *mut u8,
    len: usize,
    index: usize,
    pool: Arc<PoolInner>,
}

// Safety: exclusive ownership of a disjoint arena slice.
unsafe impl Send for OwnedMemoryBlock {}
unsafe impl Sync for OwnedMemoryBlock {}

impl OwnedMemoryBlock {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Block size in bytes (always the pool's block size).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Typed view of the block as a length-prefixed message.
    pub fn message_view(&mut self) -> MessageView<'_> {
        MessageView {
            data: self.as_mut_slice(),
        }
    }
}

impl Drop for OwnedMemoryBlock {
    fn drop(&mut self) {
        // The queue can never be full here: capacity equals the number of
        // blocks and this index was absent while the handle lived.
        let _ = self.pool.free.push(self.index);
    }
}

impl std::fmt::Debug for OwnedMemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedMemoryBlock")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// View of a block as `{u32 bytes_length}` followed by `bytes_length` bytes
/// of payload. The header travels on the wire together with the payload.
pub struct MessageView<'a> {
    data: &'a mut [u8],
}

impl MessageView<'_> {
    /// Payload length recorded in the header.
    pub fn bytes_length(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Record the payload length in the header.
    pub fn set_bytes_length(&mut self, len: u32) {
        assert!(
            len as usize <= self.capacity(),
            "payload {len} exceeds block capacity {}",
            self.capacity()
        );
        self.data[..MESSAGE_HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
    }

    /// Maximum payload the block can hold.
    pub fn capacity(&self) -> usize {
        self.data.len() - MESSAGE_HEADER_SIZE
    }

    /// Header plus payload length — the number of bytes a SEND carries.
    pub fn total_length(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.bytes_length() as usize
    }

    /// The payload as recorded by the header.
    pub fn bytes(&self) -> &[u8] {
        let len = self.bytes_length() as usize;
        &self.data[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.bytes_length() as usize;
        &mut self.data[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + len]
    }
}
