//! Java Debug Wire Protocol (JDWP) packet layer for Tether.
//!
//! This crate owns the binary packet codec (11-byte header framing), the DDMS
//! chunk sub-format embedded in JDWP payloads, and [`JdwpSession`], a
//! transport-owning send/receive endpoint used both for device-side sessions
//! and for test debugger clients.
//!
//! It is deliberately transport-agnostic above the TCP stream it is handed:
//! the ADB plumbing that produces those streams lives in `tether-adb`, and the
//! proxying/tracking logic lives in `tether-debug`.

pub mod ddms;
pub mod packet;
pub mod session;

use std::io;

use thiserror::Error;

pub use ddms::{DdmsChunk, DdmsChunkType, DdmsChunkView, HeloData};
pub use packet::{JdwpPacket, PacketKind, FLAG_REPLY, HANDSHAKE, JDWP_HEADER_LEN};
pub use session::{JdwpSession, JdwpSessionConfig};

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP handshake failed")]
    HandshakeFailed,
    #[error("JDWP operation timed out")]
    Timeout,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("JDWP operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, JdwpError>;

/// Collapse the "peer went away" shapes of an I/O error into
/// [`JdwpError::ConnectionClosed`] so callers can classify stream end without
/// digging through `io::ErrorKind`.
pub(crate) fn map_io_error(err: io::Error) -> JdwpError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => JdwpError::ConnectionClosed,
        _ => JdwpError::Io(err),
    }
}
