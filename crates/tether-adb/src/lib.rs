//! Host-side client for the ADB server ("the daemon" in protocol terms).
//!
//! This crate speaks the ADB host request/response framing over TCP: 4-hex-digit
//! length-prefixed service strings, `OKAY`/`FAIL` response headers, and the
//! streaming queries (`host:track-devices`, `track-jdwp`) built on top of it.
//! It also owns device provisioning: turning raw daemon device-list snapshots
//! into identity-stable [`DeviceHandle`]s that survive replugs.
//!
//! The JDWP packet layer lives in `tether-jdwp`; process tracking and the
//! debugger session proxy live in `tether-debug`.

mod channel;
mod host;
mod selector;
mod tracker;

use std::io;

use thiserror::Error;

pub use channel::AdbChannel;
pub use host::{
    DeviceListStream, HostServices, HostServicesConfig, JdwpPidStream, RawDeviceInfo,
    RawDeviceState, TransportId,
};
pub use selector::DeviceSelector;
pub use tracker::{DeviceHandle, DeviceState, DeviceTracker, IdentityKey};

// The fake ADB server is only needed for tests and downstream integration
// suites. Compile it for tether-adb's own unit tests unconditionally (via
// `cfg(test)`), while keeping it behind the `fake-server` feature for normal
// builds and for downstream crates.
#[cfg(any(test, feature = "fake-server"))]
pub mod fake;

#[derive(Debug, Error)]
pub enum AdbError {
    /// Malformed header, length, or hex field; never retried.
    #[error("ADB protocol error: {0}")]
    Protocol(String),
    /// The daemon explicitly returned FAIL; the message is surfaced verbatim.
    #[error("ADB request failed: {0}")]
    Failure(String),
    #[error("ADB operation timed out")]
    Timeout,
    #[error("ADB connection closed")]
    ConnectionClosed,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, AdbError>;

/// Collapse the "peer went away" shapes of an I/O error into
/// [`AdbError::ConnectionClosed`] so stream consumers can classify an
/// end-of-stream without matching on `io::ErrorKind`.
pub(crate) fn map_io_error(err: io::Error) -> AdbError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => AdbError::ConnectionClosed,
        _ => AdbError::Io(err),
    }
}
