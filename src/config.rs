//! Runtime-configurable tuning parameters for the RDMA transport.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `AXON_`) or by constructing a custom `RdmaConfig`.

/// How a connection's poller waits for completion-queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerType {
    /// Sleep on the completion channel fd; 1 ms poll timeout doubles as the
    /// shutdown check quantum.
    Blocking,
    /// Spin on `ibv_poll_cq` with a CPU pause between empty polls. Lowest
    /// latency, burns a core.
    Spinning,
}

/// Tuning parameters for connections and their buffer pools.
#[derive(Debug, Clone)]
pub struct RdmaConfig {
    /// log2 of the per-connection buffer pool size in bytes.
    pub pool_bits: u32,

    /// log2 of the pool block size in bytes.
    pub block_bits: u32,

    /// Number of receives kept posted at all times while connected.
    ///
    /// 64 of the 100 CQ entries are receives; the rest is headroom for
    /// in-flight send and read completions.
    pub recv_backlog: usize,

    /// Completion queue depth.
    pub cq_entries: i32,

    /// Maximum outstanding send work requests on the QP.
    pub max_send_wr: u32,

    /// Maximum outstanding receive work requests on the QP.
    pub max_recv_wr: u32,

    /// Maximum scatter/gather elements per work request.
    pub max_sge: u32,

    /// Completion poller strategy.
    pub poller: PollerType,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            pool_bits: 30,
            block_bits: 20,
            recv_backlog: 64,
            cq_entries: 100,
            max_send_wr: 1024,
            max_recv_wr: 1024,
            max_sge: 16,
            poller: PollerType::Blocking,
        }
    }
}

impl RdmaConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `AXON_POOL_BITS`
    /// - `AXON_BLOCK_BITS`
    /// - `AXON_RECV_BACKLOG`
    /// - `AXON_POLLER` (`block` or `spin`)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("AXON_POOL_BITS")
            && let Ok(n) = v.parse::<u32>()
        {
            cfg.pool_bits = n;
        }
        if let Ok(v) = std::env::var("AXON_BLOCK_BITS")
            && let Ok(n) = v.parse::<u32>()
        {
            cfg.block_bits = n;
        }
        if let Ok(v) = std::env::var("AXON_RECV_BACKLOG")
            && let Ok(n) = v.parse::<usize>()
        {
            cfg.recv_backlog = n;
        }
        if let Ok(v) = std::env::var("AXON_POLLER")
            && let Some(p) = parse_poller(&v)
        {
            cfg.poller = p;
        }

        cfg
    }
}

fn parse_poller(s: &str) -> Option<PollerType> {
    match s.to_ascii_lowercase().as_str() {
        "block" | "blocking" => Some(PollerType::Blocking),
        "spin" | "spinning" => Some(PollerType::Spinning),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RdmaConfig::default();
        assert_eq!(cfg.pool_bits, 30);
        assert_eq!(cfg.block_bits, 20);
        assert_eq!(cfg.recv_backlog, 64);
        assert_eq!(cfg.cq_entries, 100);
        assert_eq!(cfg.poller, PollerType::Blocking);
        // Backlog must leave CQ headroom for send/read completions.
        assert!((cfg.recv_backlog as i32) < cfg.cq_entries);
    }

    #[test]
    fn test_parse_poller() {
        assert_eq!(parse_poller("block"), Some(PollerType::Blocking));
        assert_eq!(parse_poller("Spinning"), Some(PollerType::Spinning));
        assert_eq!(parse_poller("busy"), None);
    }
}
