//! The per-process JDWP session proxy.
//!
//! The proxy owns the device-side JDWP session for one pid and exposes a
//! local listening endpoint for an external debugger. Exactly one external
//! connection is active at a time; while one is live, later connection
//! attempts wait in the listener backlog. Packets from the external debugger
//! are forwarded to the device verbatim. Packets from the device are fanned
//! out to internal subscribers unconditionally, and forwarded to the external
//! debugger unless they are DDMS traffic that belongs to the proxy's own
//! bookkeeping: DDMS command packets, replies to DDMS commands the external
//! client sent, and replies to internally-originated requests.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use tether_adb::{DeviceHandle, HostServices};
use tether_jdwp::ddms::{is_ddms_command, DdmsChunk, DDMS_COMMAND, DDMS_COMMAND_SET};
use tether_jdwp::packet::{accept_handshake, JdwpPacket, MAX_PACKET_LEN};
use tether_jdwp::{JdwpError, JdwpSession, JdwpSessionConfig};

use crate::{DebugError, Result};

/// First id used for internally-originated requests. External debuggers
/// allocate ids counting up from small integers, so a high fixed base keeps
/// the two sequences disjoint without coordination.
pub const INTERNAL_PACKET_ID_BASE: u32 = 0x4000_0000;

const INTERNAL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const EXTERNAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PACKET_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyStatus {
    /// Local endpoint an external debugger can connect to; set once the
    /// listener is bound and stable for the life of the process.
    pub socket_address: Option<SocketAddr>,
    /// True exactly while one external connection is active.
    pub is_external_debugger_attached: bool,
}

/// The device-side session plus its liveness token. The token is cancelled
/// when the session's read loop ends, which is how every waiter learns the
/// device side is gone.
struct DeviceSession {
    session: JdwpSession,
    closed: CancellationToken,
}

struct ProxyInner {
    services: HostServices,
    device: DeviceHandle,
    pid: u32,
    status: watch::Sender<ProxyStatus>,
    shutdown: CancellationToken,
    device_session: Mutex<Option<Arc<DeviceSession>>>,
    /// Every packet received from the device, replayed to internal
    /// subscribers.
    packets: broadcast::Sender<JdwpPacket>,
    next_internal_id: AtomicU32,
    /// Ids of DDMS commands sent by the external client; their replies are
    /// withheld from the external stream.
    external_ddms_ids: StdMutex<HashSet<u32>>,
    /// Write half of the active external connection, if any.
    external_writer: Mutex<Option<OwnedWriteHalf>>,
}

#[derive(Clone)]
pub struct JdwpSessionProxy {
    inner: Arc<ProxyInner>,
}

impl JdwpSessionProxy {
    pub fn new(services: HostServices, device: DeviceHandle, pid: u32) -> Self {
        let (status, _) = watch::channel(ProxyStatus::default());
        let (packets, _) = broadcast::channel(PACKET_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ProxyInner {
                services,
                device,
                pid,
                status,
                shutdown: CancellationToken::new(),
                device_session: Mutex::new(None),
                packets,
                next_internal_id: AtomicU32::new(INTERNAL_PACKET_ID_BASE),
                external_ddms_ids: StdMutex::new(HashSet::new()),
                external_writer: Mutex::new(None),
            }),
        }
    }

    /// Bind the local endpoint and start accepting external debuggers.
    pub fn start(&self) {
        tokio::spawn(run(self.inner.clone()));
    }

    pub fn status(&self) -> watch::Receiver<ProxyStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> ProxyStatus {
        *self.inner.status.borrow()
    }

    /// Observe every packet the device sends, including the DDMS traffic
    /// withheld from the external debugger.
    pub fn subscribe_packets(&self) -> broadcast::Receiver<JdwpPacket> {
        self.inner.packets.subscribe()
    }

    /// Send an internally-originated command and wait for its reply. Opens
    /// the device-side session on first use. The id is allocated from the
    /// proxy-scoped internal sequence and its reply never reaches the
    /// external debugger.
    pub async fn send_internal_command(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<JdwpPacket> {
        let inner = &self.inner;
        let session = ensure_device_session(inner).await?;
        let id = inner.next_internal_id.fetch_add(1, Ordering::Relaxed);
        // Subscribe before sending so a fast reply cannot be missed.
        let mut packets = inner.packets.subscribe();
        let packet = JdwpPacket::command(id, command_set, command, payload);
        session.session.send_packet(&packet).await?;

        let wait = async {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return Err(DebugError::Cancelled),
                    _ = session.closed.cancelled() => {
                        return Err(JdwpError::ConnectionClosed.into());
                    }
                    received = packets.recv() => match received {
                        Ok(reply) if reply.is_reply() && reply.id == id => return Ok(reply),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(JdwpError::ConnectionClosed.into());
                        }
                    },
                }
            }
        };
        tokio::time::timeout(INTERNAL_REPLY_TIMEOUT, wait)
            .await
            .map_err(|_| DebugError::Timeout)?
    }

    /// Send one DDMS chunk as an internal command and return the reply.
    pub async fn send_ddms_command(&self, chunk: DdmsChunk) -> Result<JdwpPacket> {
        self.send_internal_command(DDMS_COMMAND_SET, DDMS_COMMAND, chunk.encode())
            .await
    }

    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.status.send_modify(|status| {
            status.is_external_debugger_attached = false;
        });
    }
}

async fn run(inner: Arc<ProxyInner>) {
    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!(
                target: "tether.debug",
                pid = inner.pid,
                error = %err,
                "cannot bind JDWP proxy endpoint"
            );
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::warn!(
                target: "tether.debug",
                pid = inner.pid,
                error = %err,
                "cannot resolve JDWP proxy endpoint"
            );
            return;
        }
    };
    inner.status.send_modify(|status| {
        status.socket_address = Some(addr);
    });
    tracing::debug!(
        target: "tether.debug",
        pid = inner.pid,
        %addr,
        "JDWP proxy endpoint ready"
    );

    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = listener.accept() => res,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(
                    target: "tether.debug",
                    pid = inner.pid,
                    error = %err,
                    "JDWP proxy accept failed"
                );
                break;
            }
        };
        tracing::debug!(target: "tether.debug", pid = inner.pid, %peer, "external debugger connected");
        match serve_external(&inner, stream).await {
            Ok(()) => {
                tracing::debug!(target: "tether.debug", pid = inner.pid, "external debugger detached");
            }
            Err(err) => {
                tracing::debug!(
                    target: "tether.debug",
                    pid = inner.pid,
                    error = %err,
                    "external debugger session ended"
                );
            }
        }
    }

    inner.status.send_modify(|status| {
        status.is_external_debugger_attached = false;
    });
}

/// Relay one external connection until it detaches or the device side dies.
async fn serve_external(inner: &Arc<ProxyInner>, mut stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    accept_handshake(&mut stream, EXTERNAL_HANDSHAKE_TIMEOUT).await?;
    // Establish (or reuse) the device-side session before claiming the
    // attachment; a device that cannot be reached rejects the debugger.
    let session = ensure_device_session(inner).await?;

    let (mut reader, writer) = stream.into_split();
    *inner.external_writer.lock().await = Some(writer);
    inner.status.send_modify(|status| {
        status.is_external_debugger_attached = true;
    });

    let result = loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break Err(DebugError::Cancelled),
            _ = session.closed.cancelled() => break Err(JdwpError::ConnectionClosed.into()),
            res = JdwpPacket::read_from(&mut reader, MAX_PACKET_LEN) => res,
        };
        match read {
            Ok(packet) => {
                if is_ddms_command(&packet) {
                    inner.external_ddms_ids.lock().unwrap().insert(packet.id);
                }
                if let Err(err) = session.session.send_packet(&packet).await {
                    break Err(err.into());
                }
            }
            // The debugger hung up; that is a clean detach.
            Err(JdwpError::ConnectionClosed) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
    };

    *inner.external_writer.lock().await = None;
    inner.status.send_modify(|status| {
        status.is_external_debugger_attached = false;
    });
    result
}

/// Return the live device-side session, opening it (and its read pump) if
/// needed. The session survives external detach/reattach cycles and is only
/// replaced after it has died.
async fn ensure_device_session(inner: &Arc<ProxyInner>) -> Result<Arc<DeviceSession>> {
    let mut slot = inner.device_session.lock().await;
    if let Some(session) = slot.as_ref() {
        if !session.closed.is_cancelled() {
            return Ok(session.clone());
        }
    }

    if !inner.device.is_online() {
        return Err(tether_adb::AdbError::DeviceDisconnected.into());
    }
    let channel = inner
        .services
        .open_jdwp(&inner.device.selector(), inner.pid)
        .await?;
    let session = JdwpSession::connect(
        channel.into_inner(),
        JdwpSessionConfig {
            first_packet_id: INTERNAL_PACKET_ID_BASE,
            ..Default::default()
        },
    )
    .await?;
    tracing::debug!(
        target: "tether.debug",
        pid = inner.pid,
        serial = %inner.device.serial(),
        "device-side JDWP session opened"
    );

    let session = Arc::new(DeviceSession {
        session,
        closed: CancellationToken::new(),
    });
    *slot = Some(session.clone());
    tokio::spawn(device_pump(inner.clone(), session.clone()));
    Ok(session)
}

/// Read loop over the device-side session: fan out to internal subscribers,
/// forward the filtered stream to the attached external debugger.
async fn device_pump(inner: Arc<ProxyInner>, session: Arc<DeviceSession>) {
    loop {
        let packet = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = session.session.receive_packet() => match res {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::debug!(
                        target: "tether.debug",
                        pid = inner.pid,
                        error = %err,
                        "device-side JDWP session ended"
                    );
                    break;
                }
            },
        };

        let _ = inner.packets.send(packet.clone());

        if should_forward_to_external(&inner, &packet) {
            let mut writer = inner.external_writer.lock().await;
            if let Some(w) = writer.as_mut() {
                if let Err(err) = packet.write_to(w).await {
                    tracing::debug!(
                        target: "tether.debug",
                        pid = inner.pid,
                        error = %err,
                        "dropping external debugger connection"
                    );
                    *writer = None;
                }
            }
        }
    }

    session.closed.cancel();
    // Closing the write half makes an in-flight external receive fail with an
    // I/O error instead of hanging.
    *inner.external_writer.lock().await = None;
}

fn should_forward_to_external(inner: &ProxyInner, packet: &JdwpPacket) -> bool {
    if is_ddms_command(packet) {
        return false;
    }
    if packet.is_reply() {
        if packet.id >= INTERNAL_PACKET_ID_BASE {
            return false;
        }
        if inner.external_ddms_ids.lock().unwrap().remove(&packet.id) {
            return false;
        }
    }
    true
}
