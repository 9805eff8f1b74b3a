//! Length-exact framed handshake exchange over the TCP bootstrap channel.
//!
//! The channel carries nothing but [`HandshakeMessage`]s; application
//! payload flows over the RDMA path. Reads block until exactly one wire
//! image arrives — a peer closing mid-message surfaces as
//! [`AxonError::PeerClosed`].

use crate::error::{AxonError, Result};
use crate::rdma::wire::{HANDSHAKE_WIRE_SIZE, HandshakeMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) async fn send_handshake<S>(stream: &mut S, msg: &HandshakeMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&msg.encode()).await.map_err(map_io)?;
    Ok(())
}

pub(crate) async fn recv_handshake<S>(stream: &mut S) -> Result<HandshakeMessage>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_WIRE_SIZE];
    stream.read_exact(&mut buf).await.map_err(map_io)?;
    HandshakeMessage::decode(&buf)
}

fn map_io(e: std::io::Error) -> AxonError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AxonError::PeerClosed
    } else {
        AxonError::TcpIo(e)
    }
}
