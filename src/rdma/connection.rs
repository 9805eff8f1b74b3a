//! A reliable-connection queue pair to a single peer.
//!
//! Construction is two-phase: [`Connection::establish`] first builds the
//! verbs resources (protection domain, completion queue, queue pair in
//! INIT) and registers the buffer pool, then walks the TCP handshake —
//! ConnInfo exchange, RTR, RTS, state verification, memory-region
//! advertisement — before starting the completion poller and prefilling the
//! receive backlog.
//!
//! Buffers posted to the NIC live in the work-request context table from
//! post until completion; the poller thread is the only remover. Completed
//! receives post their replacement before the handler runs, so
//! `recv_backlog` receives are outstanding at every observable instant
//! while connected.

use crate::config::{PollerType, RdmaConfig};
use crate::error::{AxonError, Result};
use crate::memory::{BufferPool, MESSAGE_HEADER_SIZE, OwnedMemoryBlock};
use crate::rdma::bootstrap::{recv_handshake, send_handshake};
use crate::rdma::connector::ExposedRegion;
use crate::rdma::device::RdmaDevice;
use crate::rdma::handler::RdmaEventHandler;
use crate::rdma::wire::{ConnInfo, HandshakeMessage, RemoteMemoryRegion};
use ibverbs_sys::{
    ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wc_opcode, ibv_wr_opcode,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

/// What a posted work request was for; drives completion dispatch labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrKind {
    Recv,
    Send,
    Read,
}

impl WrKind {
    fn as_str(self) -> &'static str {
        match self {
            WrKind::Recv => "recv",
            WrKind::Send => "send",
            WrKind::Read => "read",
        }
    }
}

/// Buffer ownership parked while the NIC may touch it.
struct WrContext {
    block: OwnedMemoryBlock,
    kind: WrKind,
}

/// Verbs resources under construction. Dropping frees whatever was built,
/// in reverse order; `release` transfers ownership out.
struct ConnResources {
    pd: *mut ibverbs_sys::ibv_pd,
    comp_channel: *mut ibverbs_sys::ibv_comp_channel,
    cq: *mut ibverbs_sys::ibv_cq,
    qp: *mut ibverbs_sys::ibv_qp,
    local_mr: *mut ibverbs_sys::ibv_mr,
    exposed_mr: *mut ibverbs_sys::ibv_mr,
}

/// The same handles once construction succeeded; no Drop, ownership has
/// moved to the `Connection`.
struct RawHandles {
    pd: *mut ibverbs_sys::ibv_pd,
    comp_channel: *mut ibverbs_sys::ibv_comp_channel,
    cq: *mut ibverbs_sys::ibv_cq,
    qp: *mut ibverbs_sys::ibv_qp,
    local_mr: *mut ibverbs_sys::ibv_mr,
    exposed_mr: *mut ibverbs_sys::ibv_mr,
}

impl ConnResources {
    fn empty() -> Self {
        Self {
            pd: ptr::null_mut(),
            comp_channel: ptr::null_mut(),
            cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            local_mr: ptr::null_mut(),
            exposed_mr: ptr::null_mut(),
        }
    }

    fn release(self) -> RawHandles {
        let handles = RawHandles {
            pd: self.pd,
            comp_channel: self.comp_channel,
            cq: self.cq,
            qp: self.qp,
            local_mr: self.local_mr,
            exposed_mr: self.exposed_mr,
        };
        std::mem::forget(self);
        handles
    }
}

impl Drop for ConnResources {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
            if !self.comp_channel.is_null() {
                ibverbs_sys::ibv_destroy_comp_channel(self.comp_channel);
            }
            if !self.local_mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.local_mr);
            }
            if !self.exposed_mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.exposed_mr);
            }
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
        }
    }
}

/// One RC queue pair plus its protection domain, completion queue, buffer
/// pool, and work-request bookkeeping.
pub struct Connection {
    dev_port: u8,
    poller_type: PollerType,
    recv_backlog: usize,
    peer: SocketAddr,

    pd: *mut ibverbs_sys::ibv_pd,
    comp_channel: *mut ibverbs_sys::ibv_comp_channel,
    cq: *mut ibverbs_sys::ibv_cq,
    qp: *mut ibverbs_sys::ibv_qp,
    local_mr: *mut ibverbs_sys::ibv_mr,
    exposed_mr: *mut ibverbs_sys::ibv_mr,

    /// Keeps the advertised region alive for the connection's lifetime
    /// (server role).
    exposed: Option<Arc<ExposedRegion>>,

    pool: BufferPool,
    remote_mr: Mutex<Option<RemoteMemoryRegion>>,
    wr_ctx: Mutex<HashMap<u64, WrContext>>,
    next_wr_id: AtomicU64,
    is_connected: AtomicBool,
    poller_stop: AtomicBool,
    poller: Mutex<Option<std::thread::JoinHandle<()>>>,
    handler: Arc<dyn RdmaEventHandler>,
}

// Safety: the verbs pointers are thread-safe per the libibverbs contract;
// all mutable state is behind mutexes or atomics.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    /// Build the verbs resources and run the full handshake over `stream`.
    ///
    /// `exposed` selects the role: `Some` advertises the region to the peer
    /// (server), `None` expects to receive the peer's (client). Handshake
    /// failures are surfaced through `on_error` and returned; the
    /// connection is not retried.
    pub(crate) async fn establish(
        device: &RdmaDevice,
        mut stream: TcpStream,
        exposed: Option<Arc<ExposedRegion>>,
        handler: Arc<dyn RdmaEventHandler>,
        config: &RdmaConfig,
    ) -> Result<Arc<Self>> {
        let peer = stream.peer_addr().map_err(AxonError::TcpIo)?;
        let conn = Arc::new(Self::build(device, exposed, handler, config, peer)?);
        match conn.handshake(device, &mut stream).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.handler.on_error(&conn, &e);
                // A failure after the poller started must still stop it, or
                // the thread would keep the connection alive forever.
                conn.shutdown();
                Err(e)
            }
        }
    }

    fn build(
        device: &RdmaDevice,
        exposed: Option<Arc<ExposedRegion>>,
        handler: Arc<dyn RdmaEventHandler>,
        config: &RdmaConfig,
        peer: SocketAddr,
    ) -> Result<Self> {
        let pool = BufferPool::new(config.pool_bits, config.block_bits);
        let mut res = ConnResources::empty();
        unsafe {
            res.pd = ibverbs_sys::ibv_alloc_pd(device.ctx());
            if res.pd.is_null() {
                return Err(AxonError::qp("reset", last_errno()));
            }

            if config.poller == PollerType::Blocking {
                res.comp_channel = ibverbs_sys::ibv_create_comp_channel(device.ctx());
                if res.comp_channel.is_null() {
                    return Err(AxonError::qp("reset", last_errno()));
                }
                set_non_blocking((*res.comp_channel).fd)?;
            }

            res.cq = ibverbs_sys::ibv_create_cq(
                device.ctx(),
                config.cq_entries,
                ptr::null_mut(),
                res.comp_channel,
                0,
            );
            if res.cq.is_null() {
                return Err(AxonError::qp("reset", last_errno()));
            }

            let mut qp_init: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            qp_init.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            qp_init.send_cq = res.cq;
            qp_init.recv_cq = res.cq;
            qp_init.cap.max_send_wr = config.max_send_wr;
            qp_init.cap.max_recv_wr = config.max_recv_wr;
            qp_init.cap.max_send_sge = config.max_sge;
            qp_init.cap.max_recv_sge = config.max_sge;

            res.qp = ibverbs_sys::ibv_create_qp(res.pd, &mut qp_init);
            if res.qp.is_null() {
                return Err(AxonError::qp("reset", last_errno()));
            }

            // Reset → Init.
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = device.port();
            attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
                .0;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            let rc = ibverbs_sys::ibv_modify_qp(res.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(AxonError::qp("init", rc));
            }

            // One registration covers the whole pool for its lifetime.
            res.local_mr = ibverbs_sys::ibv_reg_mr(
                res.pd,
                pool.base_ptr() as *mut _,
                pool.pool_size(),
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as c_int,
            );
            if res.local_mr.is_null() {
                return Err(AxonError::qp("reg_mr", last_errno()));
            }

            if let Some(region) = &exposed {
                res.exposed_mr = ibverbs_sys::ibv_reg_mr(
                    res.pd,
                    region.as_ptr() as *mut _,
                    region.len(),
                    (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                        | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
                        .0 as c_int,
                );
                if res.exposed_mr.is_null() {
                    return Err(AxonError::qp("reg_mr", last_errno()));
                }
            }
        }

        let handles = res.release();
        Ok(Self {
            dev_port: device.port(),
            poller_type: config.poller,
            recv_backlog: config.recv_backlog,
            peer,
            pd: handles.pd,
            comp_channel: handles.comp_channel,
            cq: handles.cq,
            qp: handles.qp,
            local_mr: handles.local_mr,
            exposed_mr: handles.exposed_mr,
            exposed,
            pool,
            remote_mr: Mutex::new(None),
            wr_ctx: Mutex::new(HashMap::new()),
            next_wr_id: AtomicU64::new(1),
            is_connected: AtomicBool::new(false),
            poller_stop: AtomicBool::new(false),
            poller: Mutex::new(None),
            handler,
        })
    }

    async fn handshake(self: &Arc<Self>, device: &RdmaDevice, stream: &mut TcpStream) -> Result<()> {
        let qp_num = unsafe { (*self.qp).qp_num };
        let local = device.local_conn_info(qp_num)?;
        tracing::info!(
            peer = %self.peer,
            qp_num = local.qp_num,
            lid = local.lid,
            "sending ConnInfo"
        );
        send_handshake(stream, &HandshakeMessage::ConnInfo(local)).await?;

        let peer_info = match recv_handshake(stream).await? {
            HandshakeMessage::ConnInfo(info) => info,
            other => {
                return Err(AxonError::HandshakeProtocol {
                    expected: "ConnInfo",
                    got: other.type_tag(),
                });
            }
        };
        tracing::info!(
            peer = %self.peer,
            qp_num = peer_info.qp_num,
            lid = peer_info.lid,
            "received peer ConnInfo"
        );

        self.transit_to_rtr(&peer_info)?;
        self.transit_to_rts()?;
        self.verify_rts()?;

        // Start polling and prefill receives before any callback runs, so
        // handlers may send from inside on_connected.
        self.start_poller()?;
        for _ in 0..self.recv_backlog {
            self.post_receive()?;
        }
        self.is_connected.store(true, Ordering::Release);

        if self.exposed_mr.is_null() {
            // Client role: the server's exposed region arrives next.
            let mr = match recv_handshake(stream).await? {
                HandshakeMessage::MemoryRegion(mr) => mr,
                other => {
                    return Err(AxonError::HandshakeProtocol {
                        expected: "MemoryRegion",
                        got: other.type_tag(),
                    });
                }
            };
            tracing::info!(
                peer = %self.peer,
                addr = format_args!("{:#x}", mr.addr),
                size = mr.size,
                "received remote memory region"
            );
            *self.remote_mr.lock().expect("remote_mr lock poisoned") = Some(mr);
            self.handler
                .on_remote_memory_region_received(self, mr.addr, mr.size);
            self.handler.on_connected(self);
        } else {
            self.handler.on_connected(self);
            let info = self.exposed_region_info();
            send_handshake(stream, &HandshakeMessage::MemoryRegion(info)).await?;
            tracing::info!(peer = %self.peer, size = info.size, "sent exposed memory region");
        }
        Ok(())
    }

    fn transit_to_rtr(&self, peer: &ConnInfo) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_1024;
            attr.dest_qp_num = peer.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 1;
            attr.min_rnr_timer = 12; // 0.64 ms
            attr.ah_attr.port_num = self.dev_port;

            if peer.lid != 0 {
                // InfiniBand: subnet-local routing by LID.
                attr.ah_attr.dlid = peer.lid;
            } else {
                // RoCE: global routing header with the peer's GID.
                attr.ah_attr.is_global = 1;
                attr.ah_attr.grh.dgid.raw = peer.gid;
                attr.ah_attr.grh.hop_limit = 1;
            }

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(AxonError::qp("rtr", rc));
            }
        }
        Ok(())
    }

    fn transit_to_rts(&self) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 8; // 1.048 ms
            attr.retry_cnt = 7;
            attr.rnr_retry = 7; // infinite retry
            attr.max_rd_atomic = 1;

            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(AxonError::qp("rts", rc));
            }
        }
        Ok(())
    }

    fn verify_rts(&self) -> Result<()> {
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_qp(
                self.qp,
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as c_int,
                &mut init_attr,
            );
            if rc != 0 {
                return Err(AxonError::qp("verify", rc));
            }
            if attr.qp_state != ibv_qp_state::IBV_QPS_RTS {
                tracing::error!(state = attr.qp_state as i64, "queue pair did not reach RTS");
                return Err(AxonError::qp("verify", 0));
            }
        }
        Ok(())
    }

    fn start_poller(self: &Arc<Self>) -> Result<()> {
        let conn = Arc::clone(self);
        let handle = match self.poller_type {
            PollerType::Blocking => {
                let rc = unsafe { req_notify(self.cq) };
                if rc != 0 {
                    return Err(AxonError::post("ibv_req_notify_cq", rc));
                }
                std::thread::Builder::new()
                    .name("rdma-cq-poller".into())
                    .spawn(move || conn.poll_blocking())
                    .expect("spawn cq poller thread")
            }
            PollerType::Spinning => std::thread::Builder::new()
                .name("rdma-cq-poller".into())
                .spawn(move || conn.poll_spinning())
                .expect("spawn cq poller thread"),
        };
        *self.poller.lock().expect("poller lock poisoned") = Some(handle);
        Ok(())
    }

    /// Blocking poller: sleep on the completion channel fd, drain the CQ on
    /// each wakeup. The 1 ms poll timeout is the shutdown check quantum.
    fn poll_blocking(self: Arc<Self>) {
        const POLL_TIMEOUT_MS: c_int = 1;
        let fd = unsafe { (*self.comp_channel).fd };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        while !self.poller_stop.load(Ordering::Acquire) {
            let ret = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
            if ret == 0 {
                continue;
            }
            if ret < 0 {
                tracing::error!(
                    error = %std::io::Error::last_os_error(),
                    "poll on completion channel failed"
                );
                break;
            }

            let mut ev_cq: *mut ibverbs_sys::ibv_cq = ptr::null_mut();
            let mut ev_ctx: *mut std::ffi::c_void = ptr::null_mut();
            let rc =
                unsafe { ibverbs_sys::ibv_get_cq_event(self.comp_channel, &mut ev_cq, &mut ev_ctx) };
            if rc != 0 {
                // Readiness is only a hint.
                tracing::warn!(rc, "ibv_get_cq_event returned without an event");
                continue;
            }
            unsafe { ibverbs_sys::ibv_ack_cq_events(ev_cq, 1) };
            let rc = unsafe { req_notify(ev_cq) };
            if rc != 0 {
                tracing::warn!(rc, "ibv_req_notify_cq failed, continuing");
                continue;
            }

            while !self.poller_stop.load(Ordering::Acquire) {
                match self.poll_one() {
                    Some(wc) => {
                        if !self.handle_completion(&wc) {
                            self.poller_stop.store(true, Ordering::Release);
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Spinning poller: tight `poll_cq` loop with a CPU pause between empty
    /// polls.
    fn poll_spinning(self: Arc<Self>) {
        while !self.poller_stop.load(Ordering::Acquire) {
            while !self.poller_stop.load(Ordering::Acquire) {
                match self.poll_one() {
                    Some(wc) => {
                        if !self.handle_completion(&wc) {
                            self.poller_stop.store(true, Ordering::Release);
                            return;
                        }
                    }
                    None => break,
                }
            }
            std::hint::spin_loop();
        }
    }

    fn poll_one(&self) -> Option<ibverbs_sys::ibv_wc> {
        unsafe {
            let mut wc = ibverbs_sys::ibv_wc::default();
            let ctx = (*self.cq).context;
            let ops = &mut (*ctx).ops;
            let n = ops.poll_cq.as_mut().expect("poll_cq missing")(self.cq, 1, &mut wc as *mut _);
            if n < 0 {
                tracing::error!(n, "poll_cq failed");
                self.poller_stop.store(true, Ordering::Release);
                return None;
            }
            if n > 0 { Some(wc) } else { None }
        }
    }

    /// Dispatch one work completion. Returns false when the completion is
    /// fatal and polling must stop.
    fn handle_completion(self: &Arc<Self>, wc: &ibverbs_sys::ibv_wc) -> bool {
        let wr_id = wc.wr_id();
        if let Some((status, vendor_err)) = wc.error() {
            let err = AxonError::CompletionFailure {
                kind: self.wr_kind_str(wr_id),
                wr_id,
                status: status as u32,
                vendor_err,
            };
            tracing::error!(%err, peer = %self.peer, "fatal work completion");
            self.handler.on_error(self, &err);
            return false;
        }

        let ctx = self
            .wr_ctx
            .lock()
            .expect("wr context lock poisoned")
            .remove(&wr_id);
        let Some(WrContext { block, kind }) = ctx else {
            tracing::error!(wr_id, "no context for completed work request");
            return false;
        };

        let opcode = wc.opcode();
        if opcode & ibv_wc_opcode::IBV_WC_RECV != 0 {
            // Keep the backlog intact before application code runs.
            if let Err(e) = self.post_receive() {
                tracing::error!(error = %e, "failed to repost receive");
                self.handler.on_error(self, &e);
                return false;
            }
            self.handler.on_recv(self, block);
            return true;
        }
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => self.handler.on_sent(self, block),
            ibv_wc_opcode::IBV_WC_RDMA_READ => {
                self.handler.on_rdma_read_complete(self, wr_id, block)
            }
            other => {
                tracing::warn!(
                    opcode = other,
                    kind = kind.as_str(),
                    wr_id,
                    "dropping completion with unhandled opcode"
                );
            }
        }
        true
    }

    /// Post one receive covering a whole pool block.
    fn post_receive(&self) -> Result<()> {
        let block = self.pool.allocate()?;
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        let addr = block.as_ptr() as u64;
        let length = block.len() as u32;
        self.insert_ctx(wr_id, block, WrKind::Recv);

        let rc = unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = addr;
            sge.length = length;
            sge.lkey = self.lkey();

            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_recv.as_mut().expect("post_recv missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            )
        };
        if rc != 0 {
            self.remove_ctx(wr_id);
            return Err(AxonError::post("ibv_post_recv", rc));
        }
        tracing::trace!(wr_id, length, "posted receive");
        Ok(())
    }

    /// Post a signaled SEND carrying the block's message view (header plus
    /// payload). The block returns through `on_sent`.
    ///
    /// Panics if called before the connection is established — sending
    /// before RTS is a caller bug.
    pub fn async_send(&self, mut block: OwnedMemoryBlock) -> Result<u64> {
        assert!(
            self.is_connected(),
            "async_send on a connection that is not established"
        );
        let total = block.message_view().total_length();
        let addr = block.as_ptr() as u64;
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        self.insert_ctx(wr_id, block, WrKind::Send);

        let rc = unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = addr;
            sge.length = total as u32;
            sge.lkey = self.lkey();

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            )
        };
        if rc != 0 {
            self.remove_ctx(wr_id);
            return Err(AxonError::post("ibv_post_send", rc));
        }
        tracing::trace!(wr_id, len = total, "posted send");
        Ok(wr_id)
    }

    /// Post a signaled one-sided read of `length` bytes at `offset` into
    /// the peer's exposed region. The bytes land in the payload of a fresh
    /// pool block delivered through `on_rdma_read_complete`.
    pub fn async_read(&self, offset: u64, length: usize) -> Result<u64> {
        assert!(
            self.is_connected(),
            "async_read on a connection that is not established"
        );
        let remote = self
            .remote_mr
            .lock()
            .expect("remote_mr lock poisoned")
            .expect("async_read without a remote memory region");

        let mut block = self.pool.allocate()?;
        block.message_view().set_bytes_length(length as u32);
        let payload_addr = block.as_ptr() as u64 + MESSAGE_HEADER_SIZE as u64;
        let wr_id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        self.insert_ctx(wr_id, block, WrKind::Read);

        let rc = unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = payload_addr;
            sge.length = length as u32;
            sge.lkey = self.lkey();

            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = remote.addr + offset;
            wr.wr.rdma.rkey = remote.rkey;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            ops.post_send.as_mut().expect("post_send missing")(
                self.qp,
                &mut wr as *mut _,
                &mut bad_wr as *mut _,
            )
        };
        if rc != 0 {
            self.remove_ctx(wr_id);
            return Err(AxonError::post("ibv_post_send", rc));
        }
        tracing::trace!(wr_id, offset, length, "posted rdma read");
        Ok(wr_id)
    }

    /// Take a block from this connection's registered pool, e.g. to build
    /// an outbound message.
    pub fn allocate_buffer(&self) -> Result<OwnedMemoryBlock> {
        self.pool.allocate()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The peer's exposed region descriptor (client role, after handshake).
    pub fn remote_memory_region(&self) -> Option<RemoteMemoryRegion> {
        *self.remote_mr.lock().expect("remote_mr lock poisoned")
    }

    /// Number of receives currently posted. Equals the configured backlog
    /// at every observable instant while connected.
    pub fn pending_receives(&self) -> usize {
        self.wr_ctx
            .lock()
            .expect("wr context lock poisoned")
            .values()
            .filter(|c| c.kind == WrKind::Recv)
            .count()
    }

    /// Total work requests posted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.wr_ctx.lock().expect("wr context lock poisoned").len()
    }

    /// Stop the poller and wait for it to exit. Idempotent; outstanding
    /// work requests are abandoned.
    pub fn shutdown(&self) {
        self.poller_stop.store(true, Ordering::Release);
        let handle = self.poller.lock().expect("poller lock poisoned").take();
        if let Some(h) = handle
            && h.thread().id() != std::thread::current().id()
        {
            let _ = h.join();
        }
    }

    fn exposed_region_info(&self) -> RemoteMemoryRegion {
        let region = self
            .exposed
            .as_ref()
            .expect("server role holds an exposed region");
        RemoteMemoryRegion {
            addr: region.as_ptr() as u64,
            size: region.len() as u64,
            rkey: unsafe { (*self.exposed_mr).rkey },
        }
    }

    fn insert_ctx(&self, wr_id: u64, block: OwnedMemoryBlock, kind: WrKind) {
        self.wr_ctx
            .lock()
            .expect("wr context lock poisoned")
            .insert(wr_id, WrContext { block, kind });
    }

    fn remove_ctx(&self, wr_id: u64) {
        self.wr_ctx
            .lock()
            .expect("wr context lock poisoned")
            .remove(&wr_id);
    }

    fn wr_kind_str(&self, wr_id: u64) -> &'static str {
        self.wr_ctx
            .lock()
            .expect("wr context lock poisoned")
            .get(&wr_id)
            .map(|c| c.kind.as_str())
            .unwrap_or("unknown")
    }

    fn lkey(&self) -> u32 {
        unsafe { (*self.local_mr).lkey }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
        // Abandoned work requests die with the QP; their buffers go back to
        // the pool here.
        if let Ok(mut table) = self.wr_ctx.lock() {
            table.clear();
        }
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
            if !self.comp_channel.is_null() {
                ibverbs_sys::ibv_destroy_comp_channel(self.comp_channel);
            }
            if !self.local_mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.local_mr);
            }
            if !self.exposed_mr.is_null() {
                ibverbs_sys::ibv_dereg_mr(self.exposed_mr);
            }
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
        }
    }
}

/// Arm CQ notification via the ibverbs ops table.
unsafe fn req_notify(cq: *mut ibverbs_sys::ibv_cq) -> c_int {
    unsafe {
        let ctx = (*cq).context;
        let ops = &mut (*ctx).ops;
        ops.req_notify_cq.as_mut().expect("req_notify_cq missing")(cq, 0)
    }
}

fn set_non_blocking(fd: c_int) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(AxonError::qp("reset", last_errno()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(AxonError::qp("reset", last_errno()));
        }
    }
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}
