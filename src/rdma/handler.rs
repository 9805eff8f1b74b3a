//! Event-handler capability set consumed by [`Connection`].

use crate::error::AxonError;
use crate::memory::OwnedMemoryBlock;
use crate::rdma::Connection;
use std::sync::Arc;

/// Callbacks a connection delivers as its handshake and completions
/// progress.
///
/// `on_recv` runs on the connection's poller thread after the replacement
/// receive has been posted, so the receive backlog is intact by the time
/// application code sees the message. Every callback that carries an
/// [`OwnedMemoryBlock`] owns it; dropping the block returns it to the
/// connection's pool.
///
/// Implementations must be `Send + Sync`: callbacks arrive from the poller
/// thread and from the bootstrap task.
pub trait RdmaEventHandler: Send + Sync {
    /// The queue pair reached RTS and the handshake finished. The
    /// connection accepts sends from inside this callback.
    fn on_connected(&self, _conn: &Arc<Connection>) {}

    /// Client role only: the server's exposed region descriptor arrived.
    /// Fires before `on_connected`.
    fn on_remote_memory_region_received(&self, _conn: &Arc<Connection>, _addr: u64, _size: u64) {}

    /// An inbound message landed in `buf`; its message view describes the
    /// payload.
    fn on_recv(&self, conn: &Arc<Connection>, buf: OwnedMemoryBlock);

    /// A send completed; `buf` is the block passed to `async_send`.
    fn on_sent(&self, _conn: &Arc<Connection>, _buf: OwnedMemoryBlock) {}

    /// A one-sided read completed; the view's payload holds the remote
    /// bytes.
    fn on_rdma_read_complete(&self, _conn: &Arc<Connection>, _wr_id: u64, _buf: OwnedMemoryBlock) {}

    /// The connection hit a fatal condition (handshake failure or failed
    /// work completion). The connection is not retried internally.
    fn on_error(&self, _conn: &Arc<Connection>, error: &AxonError) {
        tracing::error!(%error, "RDMA connection error");
    }
}
