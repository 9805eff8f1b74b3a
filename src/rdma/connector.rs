//! Connection factory: opens a device once, then spawns one
//! [`Connection`] per accepted or dialed peer.

use crate::config::RdmaConfig;
use crate::error::{AxonError, Result};
use crate::rdma::connection::Connection;
use crate::rdma::device::RdmaDevice;
use crate::rdma::handler::RdmaEventHandler;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};

/// A page-aligned byte region a server advertises for one-sided access.
///
/// Registered with each server-role connection's protection domain; the
/// peer reads (or writes) it directly once it holds the descriptor. Local
/// access while remote operations are in flight is unsynchronized by
/// design — the embedding owns that coordination.
pub struct ExposedRegion {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

// Safety: plain memory whose lifetime is tied to this struct.
unsafe impl Send for ExposedRegion {}
unsafe impl Sync for ExposedRegion {}

impl ExposedRegion {
    /// Allocate a zeroed region of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        let layout =
            Layout::from_size_align(len, 4096).expect("page-aligned region layout is valid");
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        Self { ptr, len, layout }
    }

    /// Allocate a region with every byte set to `fill`.
    pub fn filled(len: usize, fill: u8) -> Self {
        let mut region = Self::zeroed(len);
        region.as_mut_slice().fill(fill);
        region
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

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
}

impl Drop for ExposedRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Opens an RDMA device and mints [`Connection`]s over a TCP bootstrap
/// channel.
///
/// Declared field order matters: connections drop before the device they
/// were built on.
pub struct RdmaConnector {
    connections: Mutex<Vec<Arc<Connection>>>,
    handler: Arc<dyn RdmaEventHandler>,
    config: RdmaConfig,
    device: RdmaDevice,
}

impl RdmaConnector {
    /// Open `device_name` with default tuning.
    pub fn new(device_name: &str, handler: Arc<dyn RdmaEventHandler>) -> Result<Arc<Self>> {
        Self::with_config(device_name, handler, RdmaConfig::default())
    }

    pub fn with_config(
        device_name: &str,
        handler: Arc<dyn RdmaEventHandler>,
        config: RdmaConfig,
    ) -> Result<Arc<Self>> {
        let device = RdmaDevice::open(device_name)?;
        Ok(Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            handler,
            config,
            device,
        }))
    }

    /// Bind `port` (0 picks an ephemeral one) and run the accept loop as a
    /// background task. Every accepted peer becomes a server-role
    /// connection advertising `exposed`.
    ///
    /// Returns the bound port. An accept failure aborts the loop — the
    /// bootstrap listener is not something the transport can limp along
    /// without.
    pub async fn listen_tcp(
        self: &Arc<Self>,
        port: u16,
        exposed: Arc<ExposedRegion>,
    ) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(AxonError::TcpIo)?;
        let bound = listener.local_addr().map_err(AxonError::TcpIo)?.port();
        tracing::info!(port = bound, "TCP bootstrap listening");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "accepted bootstrap connection");
                        let established = Connection::establish(
                            &this.device,
                            stream,
                            Some(Arc::clone(&exposed)),
                            Arc::clone(&this.handler),
                            &this.config,
                        )
                        .await;
                        match established {
                            Ok(conn) => this
                                .connections
                                .lock()
                                .expect("connections lock poisoned")
                                .push(conn),
                            Err(e) => {
                                tracing::error!(%peer, error = %e, "connection establishment failed")
                            }
                        }
                    }
                    Err(e) => {
                        let e = AxonError::TcpAcceptFailed(e);
                        tracing::error!(error = %e, "aborting accept loop");
                        break;
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Dial a listening peer and establish a client-role connection. The
    /// peer's exposed region descriptor arrives during the handshake.
    pub async fn connect_tcp(self: &Arc<Self>, host: &str, port: u16) -> Result<Arc<Connection>> {
        tracing::info!(host, port, "connecting TCP bootstrap");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(AxonError::TcpIo)?;
        let conn = Connection::establish(
            &self.device,
            stream,
            None,
            Arc::clone(&self.handler),
            &self.config,
        )
        .await?;
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .push(Arc::clone(&conn));
        Ok(conn)
    }

    /// The first connection, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .first()
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .clone()
    }

    /// The opened device's name and active port.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Stop every connection's poller. Called before drop so no poller
    /// still references the device.
    pub fn shutdown(&self) {
        let conns = self.connections();
        for conn in conns {
            conn.shutdown();
        }
    }
}

impl Drop for RdmaConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
