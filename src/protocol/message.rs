//! Serialized control messages exchanged between frontends, the
//! dispatcher, and backends.
//!
//! A message rides in one pool block: the block's message-view header holds
//! the serialized length, the payload is the rkyv-encoded body. Query
//! payloads (tensor inputs) do NOT flow through this enum — they travel by
//! one-sided reads against the exposed region.

use crate::error::{AxonError, Result};

/// Punch clock stamped as a query moves through the pipeline, nanoseconds
/// since the Unix epoch. Zero means "not reached yet".
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryClock {
    /// When the frontend accepted the query.
    pub frontend_recv_ns: u64,
    /// When the dispatcher's transport delivered the message, captured
    /// before parsing.
    pub dispatcher_recv_ns: u64,
    /// When the dispatcher finished parsing and was about to enqueue.
    pub dispatcher_sched_ns: u64,
}

/// Outcome of routing a dispatch to a model-session queue.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Ok,
    /// No model session is installed at the requested index.
    ModelNotFound,
    /// The model-session queue refused the query.
    QueueFull,
}

/// A frontend's request to route one query to a model session.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub model_index: u32,
    pub query_id: u64,
    /// Assigned by the dispatcher; zero on the wire from the frontend.
    pub global_id: u64,
    pub clock: QueryClock,
}

/// Echo of a failed query so the frontend can reconcile its clock.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryEcho {
    pub query_id: u64,
    pub clock: QueryClock,
}

/// Sent back over the same connection only when dispatch fails; success is
/// silent.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DispatchReply {
    pub status: DispatchStatus,
    pub model_index: u32,
    pub query_list: Vec<QueryEcho>,
}

/// Control messages exchanged between serving nodes.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Dispatch(DispatchRequest),
    DispatchReply(DispatchReply),
}

/// Encode a `ControlMessage` into rkyv bytes.
pub fn encode(msg: &ControlMessage) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| AxonError::EncodeFailed(e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Decode a `ControlMessage` from received bytes.
///
/// Copies into an aligned buffer first: a message-view payload starts four
/// bytes into its block, which is below rkyv's alignment requirement.
pub fn decode(bytes: &[u8]) -> Result<ControlMessage> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| AxonError::DecodeFailed(e.to_string()))
}
