//! Debuggable-process tracking and JDWP session proxying.
//!
//! For every connected device, a [`JdwpProcessTracker`] runs the daemon's
//! `track-jdwp` streaming query and maintains the live set of debuggable
//! processes. Each tracked process owns a [`JdwpSessionProxy`]: a local
//! listening endpoint that relays the device-side JDWP session to at most one
//! external debugger at a time, while DDMS traffic stays observable to
//! internal subscribers.

mod process;
mod process_map;
mod proxy;
mod tracker;

use thiserror::Error;

pub use process::{JdwpProcess, JdwpProcessProperties};
pub use process_map::{ProcessMap, Release};
pub use proxy::{JdwpSessionProxy, ProxyStatus, INTERNAL_PACKET_ID_BASE};
pub use tracker::{JdwpProcessTracker, TRACK_JDWP_RETRY_DELAY};

#[derive(Debug, Error)]
pub enum DebugError {
    #[error(transparent)]
    Adb(#[from] tether_adb::AdbError),
    #[error(transparent)]
    Jdwp(#[from] tether_jdwp::JdwpError),
    #[error("operation timed out")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DebugError>;
