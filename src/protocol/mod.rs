//! Control messages carried over RDMA SEND.

mod message;

pub use message::{
    ControlMessage, DispatchReply, DispatchRequest, DispatchStatus, QueryClock, QueryEcho, decode,
    encode,
};
