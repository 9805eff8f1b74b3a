//! Fixed-size handshake wire format for the TCP bootstrap channel.
//!
//! Each side sends `ConnInfo`, then the server sends its exposed
//! `MemoryRegion`. Both peers encode with the same explicit little-endian
//! layout, so the 28-byte image is bit-for-bit identical across hosts.

use crate::error::{AxonError, Result};

/// Encoded size of every handshake message: a `u32` type tag plus a 24-byte
/// payload area (zero padded).
pub const HANDSHAKE_WIRE_SIZE: usize = 28;

const TYPE_CONN_INFO: u32 = 1;
const TYPE_MEMORY_REGION: u32 = 2;

/// Queue-pair addressing info exchanged before the RTR transition.
///
/// `lid == 0` signals RoCE (route by GID); non-zero signals InfiniBand
/// (route by LID).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub lid: u16,
    pub gid: [u8; 16],
    pub qp_num: u32,
}

/// Descriptor of a peer's remote-accessible memory region. Purely
/// descriptive; holds no local resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMemoryRegion {
    pub addr: u64,
    pub size: u64,
    pub rkey: u32,
}

/// One bootstrap-channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    ConnInfo(ConnInfo),
    MemoryRegion(RemoteMemoryRegion),
}

impl HandshakeMessage {
    pub fn encode(&self) -> [u8; HANDSHAKE_WIRE_SIZE] {
        let mut buf = [0u8; HANDSHAKE_WIRE_SIZE];
        match self {
            HandshakeMessage::ConnInfo(info) => {
                buf[0..4].copy_from_slice(&TYPE_CONN_INFO.to_le_bytes());
                buf[4..6].copy_from_slice(&info.lid.to_le_bytes());
                buf[6..22].copy_from_slice(&info.gid);
                buf[22..26].copy_from_slice(&info.qp_num.to_le_bytes());
            }
            HandshakeMessage::MemoryRegion(mr) => {
                buf[0..4].copy_from_slice(&TYPE_MEMORY_REGION.to_le_bytes());
                buf[4..12].copy_from_slice(&mr.addr.to_le_bytes());
                buf[12..20].copy_from_slice(&mr.size.to_le_bytes());
                buf[20..24].copy_from_slice(&mr.rkey.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_WIRE_SIZE]) -> Result<Self> {
        let ty = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match ty {
            TYPE_CONN_INFO => {
                let mut gid = [0u8; 16];
                gid.copy_from_slice(&buf[6..22]);
                Ok(HandshakeMessage::ConnInfo(ConnInfo {
                    lid: u16::from_le_bytes([buf[4], buf[5]]),
                    gid,
                    qp_num: u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]),
                }))
            }
            TYPE_MEMORY_REGION => Ok(HandshakeMessage::MemoryRegion(RemoteMemoryRegion {
                addr: u64::from_le_bytes(buf[4..12].try_into().expect("8-byte slice")),
                size: u64::from_le_bytes(buf[12..20].try_into().expect("8-byte slice")),
                rkey: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            })),
            got => Err(AxonError::HandshakeProtocol {
                expected: "ConnInfo or MemoryRegion",
                got,
            }),
        }
    }

    /// The wire type tag, for protocol-violation reporting.
    pub fn type_tag(&self) -> u32 {
        match self {
            HandshakeMessage::ConnInfo(_) => TYPE_CONN_INFO,
            HandshakeMessage::MemoryRegion(_) => TYPE_MEMORY_REGION,
        }
    }
}
