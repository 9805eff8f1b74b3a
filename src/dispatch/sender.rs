//! Outbound control-message path: serialize into a pool block and post.

use crate::error::{AxonError, Result};
use crate::protocol::{self, ControlMessage};
use crate::rdma::Connection;
use std::sync::Arc;

/// Serialize `msg` into one of `conn`'s pool blocks and post it as a SEND.
///
/// The block returns to the pool when the send completion fires. Fails with
/// `PoolExhausted` under backpressure and `EncodeFailed` if the message
/// cannot fit one block.
pub fn send_control(conn: &Arc<Connection>, msg: &ControlMessage) -> Result<u64> {
    let payload = protocol::encode(msg)?;
    let mut block = conn.allocate_buffer()?;
    let mut view = block.message_view();
    if payload.len() > view.capacity() {
        return Err(AxonError::EncodeFailed(format!(
            "control message of {} bytes exceeds block capacity {}",
            payload.len(),
            view.capacity()
        )));
    }
    view.set_bytes_length(payload.len() as u32);
    view.bytes_mut().copy_from_slice(&payload);
    conn.async_send(block)
}
