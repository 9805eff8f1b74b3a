//! RDMA-fronted host for the dispatch ingress.
//!
//! Owns one connector listening for frontend connections and a dedicated
//! thread driving the bootstrap runtime. Dispatches arrive on connection
//! poller threads, go through the ingress, and answer back over the same
//! connection only on failure.

use crate::clock;
use crate::config::RdmaConfig;
use crate::dispatch::ingress::{DispatchIngress, GlobalIdIssuer, RequestEntrance};
use crate::dispatch::sender::send_control;
use crate::error::{AxonError, Result};
use crate::memory::OwnedMemoryBlock;
use crate::protocol::{self, ControlMessage};
use crate::rdma::{Connection, ExposedRegion, RdmaConnector, RdmaEventHandler};
use crate::util::pin_to_core;
use std::sync::Arc;
use tokio::sync::Notify;

struct WorkerHandler {
    ingress: DispatchIngress,
}

impl RdmaEventHandler for WorkerHandler {
    fn on_recv(&self, conn: &Arc<Connection>, mut buf: OwnedMemoryBlock) {
        // Captured at ingress, before parsing.
        let dispatcher_recv_ns = clock::now_ns();

        let view = buf.message_view();
        let msg = match protocol::decode(view.bytes()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, peer = %conn.peer_addr(), "control message decode failed");
                return;
            }
        };

        match msg {
            ControlMessage::Dispatch(request) => {
                if let Some(reply) = self.ingress.handle_dispatch(request, dispatcher_recv_ns) {
                    // Reply travels only on failure.
                    if let Err(e) = send_control(conn, &ControlMessage::DispatchReply(reply)) {
                        tracing::error!(error = %e, "failed to send dispatch reply");
                    }
                }
            }
            other => tracing::error!(message = ?other, "unhandled control message"),
        }
    }

    fn on_error(&self, conn: &Arc<Connection>, error: &AxonError) {
        tracing::error!(peer = %conn.peer_addr(), %error, "dispatch worker connection error");
    }
}

/// Dispatcher-side worker: accepts frontend connections over the RDMA
/// transport and routes their queries into model-session queues.
pub struct DispatchWorker {
    connector: Arc<RdmaConnector>,
    handler: Arc<WorkerHandler>,
    exposed: Arc<ExposedRegion>,
    tcp_port: u16,
    stop: Arc<Notify>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DispatchWorker {
    /// Build a worker on `rdma_dev`, to listen on `tcp_port` (0 picks an
    /// ephemeral port at start). `exposed` is advertised to every frontend
    /// for one-sided query-payload transfers.
    pub fn new(
        rdma_dev: &str,
        tcp_port: u16,
        exposed: Arc<ExposedRegion>,
        global_ids: Arc<GlobalIdIssuer>,
        config: RdmaConfig,
    ) -> Result<Self> {
        let handler = Arc::new(WorkerHandler {
            ingress: DispatchIngress::new(global_ids),
        });
        let connector = RdmaConnector::with_config(
            rdma_dev,
            Arc::clone(&handler) as Arc<dyn RdmaEventHandler>,
            config,
        )?;
        Ok(Self {
            connector,
            handler,
            exposed,
            tcp_port,
            stop: Arc::new(Notify::new()),
            thread: None,
        })
    }

    /// Spawn the worker thread and start listening, optionally pinning the
    /// thread to a CPU core. Returns the bound TCP port once the listener
    /// is up.
    pub fn start(&mut self, pin_core: Option<usize>) -> Result<u16> {
        let (tx, rx) = std::sync::mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let exposed = Arc::clone(&self.exposed);
        let stop = Arc::clone(&self.stop);
        let port = self.tcp_port;

        let handle = std::thread::Builder::new()
            .name("dispatch-worker".into())
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_to_core(core);
                }
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("build dispatch worker runtime");
                rt.block_on(async move {
                    let bound = connector.listen_tcp(port, exposed).await;
                    let listening = bound.is_ok();
                    let _ = tx.send(bound);
                    if listening {
                        stop.notified().await;
                    }
                });
            })
            .expect("spawn dispatch worker thread");
        self.thread = Some(handle);

        match rx.recv() {
            Ok(Ok(bound)) => {
                tracing::info!(port = bound, "dispatch worker listening");
                Ok(bound)
            }
            Ok(Err(e)) => {
                self.join();
                Err(e)
            }
            Err(_) => {
                self.join();
                Err(AxonError::TcpIo(std::io::Error::other(
                    "dispatch worker thread died during startup",
                )))
            }
        }
    }

    /// Stop accepting and shut down every connection's poller.
    pub fn stop(&self) {
        self.stop.notify_one();
        self.connector.shutdown();
    }

    /// Wait for the worker thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Install a model-session entrance for routing.
    pub fn add_model_session(&self, entrance: Arc<dyn RequestEntrance>) {
        self.handler.ingress.add_model_session(entrance);
    }

    /// The connector, e.g. to inspect accepted connections.
    pub fn connector(&self) -> &Arc<RdmaConnector> {
        &self.connector
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
