//! JDWP packet framing.
//!
//! Every JDWP message is an 11-byte header followed by a payload:
//! 4-byte big-endian length (total packet size, header included), 4-byte
//! big-endian id, one flags byte (bit 0x80 marks a reply), then either a
//! command discriminator (cmd-set byte + cmd byte) or a 2-byte error code.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{map_io_error, JdwpError, Result};

pub const JDWP_HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;
pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";

/// Upper bound on a single packet's declared length. Anything larger is
/// treated as a framing error rather than an allocation request.
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JdwpPacket {
    pub id: u32,
    pub flags: u8,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl JdwpPacket {
    pub fn command(id: u32, command_set: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: 0,
            kind: PacketKind::Command {
                command_set,
                command,
            },
            payload,
        }
    }

    pub fn reply(id: u32, error_code: u16, payload: Vec<u8>) -> Self {
        Self {
            id,
            flags: FLAG_REPLY,
            kind: PacketKind::Reply { error_code },
            payload,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, PacketKind::Reply { .. })
    }

    /// Total wire size of the packet; by construction always
    /// `JDWP_HEADER_LEN + payload.len()`.
    pub fn length(&self) -> u32 {
        (JDWP_HEADER_LEN + self.payload.len()) as u32
    }

    pub fn command_set(&self) -> Option<u8> {
        match self.kind {
            PacketKind::Command { command_set, .. } => Some(command_set),
            PacketKind::Reply { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<u16> {
        match self.kind {
            PacketKind::Reply { error_code } => Some(error_code),
            PacketKind::Command { .. } => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JDWP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.length().to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        match self.kind {
            PacketKind::Command {
                command_set,
                command,
            } => {
                out.push(self.flags & !FLAG_REPLY);
                out.push(command_set);
                out.push(command);
            }
            PacketKind::Reply { error_code } => {
                out.push(self.flags | FLAG_REPLY);
                out.extend_from_slice(&error_code.to_be_bytes());
            }
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a single complete packet. The buffer must contain exactly one
    /// packet; a length field that disagrees with the buffer is a framing
    /// error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < JDWP_HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "packet too short: {} byte(s), need at least {JDWP_HEADER_LEN}",
                buf.len()
            )));
        }
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length != buf.len() {
            return Err(JdwpError::Protocol(format!(
                "length field {length} does not match packet size {}",
                buf.len()
            )));
        }
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let flags = buf[8];
        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: u16::from_be_bytes([buf[9], buf[10]]),
            }
        } else {
            PacketKind::Command {
                command_set: buf[9],
                command: buf[10],
            }
        };
        Ok(Self {
            id,
            flags,
            kind,
            payload: buf[JDWP_HEADER_LEN..].to_vec(),
        })
    }

    /// Read one packet off the stream. `max_packet_len` bounds the declared
    /// length; a header claiming less than [`JDWP_HEADER_LEN`] or more than
    /// the cap fails with [`JdwpError::Protocol`].
    pub async fn read_from<R>(reader: &mut R, max_packet_len: usize) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; JDWP_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .map_err(map_io_error)?;

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length < JDWP_HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "packet length {length} smaller than header"
            )));
        }
        if length > max_packet_len {
            return Err(JdwpError::Protocol(format!(
                "packet length {length} exceeds limit {max_packet_len}"
            )));
        }

        let mut payload = vec![0u8; length - JDWP_HEADER_LEN];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(map_io_error)?;

        let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        let kind = if flags & FLAG_REPLY != 0 {
            PacketKind::Reply {
                error_code: u16::from_be_bytes([header[9], header[10]]),
            }
        } else {
            PacketKind::Command {
                command_set: header[9],
                command: header[10],
            }
        };
        Ok(Self {
            id,
            flags,
            kind,
            payload,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(&self.encode())
            .await
            .map_err(map_io_error)
    }
}

/// Client-side handshake: send `JDWP-Handshake`, expect it echoed back.
pub async fn perform_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        stream.write_all(HANDSHAKE).await.map_err(map_io_error)?;
        let mut echo = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut echo).await.map_err(map_io_error)?;
        if echo != *HANDSHAKE {
            return Err(JdwpError::HandshakeFailed);
        }
        Ok(())
    })
    .await
    .map_err(|_| JdwpError::Timeout)?
}

/// Server-side handshake: expect `JDWP-Handshake`, echo it back. Used by the
/// session proxy's debugger-facing endpoint and by test VMs.
pub async fn accept_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        let mut greeting = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut greeting).await.map_err(map_io_error)?;
        if greeting != *HANDSHAKE {
            return Err(JdwpError::HandshakeFailed);
        }
        stream.write_all(HANDSHAKE).await.map_err(map_io_error)?;
        Ok(())
    })
    .await
    .map_err(|_| JdwpError::Timeout)?
}
