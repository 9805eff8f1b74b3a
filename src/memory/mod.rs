//! Pinned buffer pool for NIC-owned memory.

mod pool;

pub use pool::{BufferPool, MESSAGE_HEADER_SIZE, MessageView, OwnedMemoryBlock};
