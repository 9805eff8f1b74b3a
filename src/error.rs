pub type Result<T> = std::result::Result<T, AxonError>;

#[derive(Debug, thiserror::Error)]
pub enum AxonError {
    #[error("RDMA device {name} not found")]
    DeviceNotFound { name: String },

    #[error("no active port on RDMA device {name}")]
    NoActivePort { name: String },

    #[error("buffer pool exhausted: all {total_blocks} blocks in use")]
    PoolExhausted { total_blocks: usize },

    #[error("TCP I/O error on bootstrap channel: {0}")]
    TcpIo(#[from] std::io::Error),

    #[error("TCP accept failed: {0}")]
    TcpAcceptFailed(std::io::Error),

    #[error("peer closed the bootstrap channel mid-handshake")]
    PeerClosed,

    #[error("handshake protocol violation: expected {expected}, got message type {got}")]
    HandshakeProtocol { expected: &'static str, got: u32 },

    #[error("queue pair transition failed at {stage} (errno {errno})")]
    QpTransition { stage: &'static str, errno: i32 },

    #[error("{op} failed (errno {errno})")]
    PostFailed { op: &'static str, errno: i32 },

    #[error("work completion failed: {kind} wr_id={wr_id} status={status} vendor_err={vendor_err}")]
    CompletionFailure {
        kind: &'static str,
        wr_id: u64,
        status: u32,
        vendor_err: u32,
    },

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("overlapping batch plan: plan {plan_id} fired while another batch is executing")]
    PlanOverlap { plan_id: u64 },
}

impl AxonError {
    /// Create a `QpTransition` error for a failed verb at the given stage.
    pub fn qp(stage: &'static str, errno: i32) -> Self {
        Self::QpTransition { stage, errno }
    }

    /// Create a `PostFailed` error for the given verb.
    pub fn post(op: &'static str, errno: i32) -> Self {
        Self::PostFailed { op, errno }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_not_found_display() {
        let e = AxonError::DeviceNotFound {
            name: "mlx5_0".into(),
        };
        assert_eq!(e.to_string(), "RDMA device mlx5_0 not found");
    }

    #[test]
    fn test_qp_transition_display() {
        let e = AxonError::qp("rtr", 22);
        assert_eq!(
            e.to_string(),
            "queue pair transition failed at rtr (errno 22)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: AxonError = io_err.into();
        assert!(e.to_string().contains("refused"));
    }

    #[test]
    fn test_all_variants_display() {
        // Ensure all variants produce non-empty display strings
        let errors: Vec<AxonError> = vec![
            AxonError::DeviceNotFound { name: "x".into() },
            AxonError::NoActivePort { name: "x".into() },
            AxonError::PoolExhausted { total_blocks: 1024 },
            AxonError::TcpIo(std::io::Error::other("x")),
            AxonError::TcpAcceptFailed(std::io::Error::other("x")),
            AxonError::PeerClosed,
            AxonError::HandshakeProtocol {
                expected: "ConnInfo",
                got: 7,
            },
            AxonError::qp("init", 1),
            AxonError::post("ibv_post_send", 12),
            AxonError::CompletionFailure {
                kind: "recv",
                wr_id: 42,
                status: 5,
                vendor_err: 0,
            },
            AxonError::EncodeFailed("bad".into()),
            AxonError::DecodeFailed("bad".into()),
            AxonError::Cancelled,
            AxonError::PlanOverlap { plan_id: 9 },
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
