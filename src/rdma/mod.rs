//! Reliable-connection RDMA transport with out-of-band TCP bootstrapping.
//!
//! Uses raw `ibverbs-sys` FFI (no safe wrapper).
//!
//! Connection lifecycle:
//! 1. [`RdmaConnector::new`] — opens the named device, picks its first
//!    active port.
//! 2. [`RdmaConnector::listen_tcp`] / [`RdmaConnector::connect_tcp`] — one
//!    [`Connection`] per accepted or dialed peer.
//! 3. Each connection walks its queue pair Reset → Init → RTR → RTS,
//!    exchanging `ConnInfo` (and the server's exposed memory region) over
//!    the TCP channel.
//! 4. Once at RTS, a per-connection poller thread drains the completion
//!    queue and drives the [`RdmaEventHandler`] callbacks.

mod bootstrap;
mod connection;
mod connector;
pub mod device;
mod handler;
mod wire;

pub use connection::Connection;
pub use connector::{ExposedRegion, RdmaConnector};
pub use handler::RdmaEventHandler;
pub use wire::{ConnInfo, HandshakeMessage, RemoteMemoryRegion};
