//! An in-process fake ADB server for unit/integration testing.
//!
//! It intentionally supports a *small* subset of the host protocol sufficient
//! to exercise tether-adb and tether-debug without a real daemon or device:
//! device-list queries and tracking, transport selection, `shell:getprop`,
//! `track-jdwp`, and a minimal per-process JDWP VM behind `jdwp:<pid>` that
//! echoes replies and answers DDMS `HELO`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use tether_jdwp::ddms::{chunks, DdmsChunk, DdmsChunkType, HeloData};
use tether_jdwp::packet::{accept_handshake, JdwpPacket, MAX_PACKET_LEN};

use crate::host::{HostServices, HostServicesConfig};

const FAKE_VM_VERSION: u32 = 1;
const FAKE_VM_IDENT: &str = "FakeVM v1.0";

/// Ids for packets the fake VM originates on its own (unsolicited DDMS
/// chunks). Kept far away from both debugger ids and proxy-internal ids.
static NEXT_VM_PACKET_ID: AtomicU32 = AtomicU32::new(0x7F00_0000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeDeviceStatus {
    Online,
    Unauthorized,
    Offline,
}

impl FakeDeviceStatus {
    fn label(&self) -> &'static str {
        match self {
            Self::Online => "device",
            Self::Unauthorized => "unauthorized",
            Self::Offline => "offline",
        }
    }
}

struct FakeClient {
    process_name: String,
    token: CancellationToken,
    inject: broadcast::Sender<JdwpPacket>,
}

struct FakeDevice {
    status: FakeDeviceStatus,
    props: HashMap<String, String>,
    transport_id: u64,
    clients: BTreeMap<u32, FakeClient>,
    /// Cancelled when the device disconnects; every open service connection
    /// scoped to the device dies with it.
    scope: CancellationToken,
    /// Replaced by [`FakeAdbServer::end_track_jdwp_streams`] to force an EOF
    /// on live `track-jdwp` streams while the device stays connected.
    track_jdwp_generation: CancellationToken,
    fail_next_track_jdwp: bool,
}

struct ServerState {
    devices: Mutex<BTreeMap<String, FakeDevice>>,
    /// Bumped on every mutation; snapshot-streaming connections re-send on
    /// change.
    epoch: watch::Sender<u64>,
    shutdown: CancellationToken,
    next_transport_id: AtomicU64,
}

impl ServerState {
    fn notify(&self) {
        self.epoch.send_modify(|v| *v += 1);
    }

    fn device_list_payload(&self) -> Vec<u8> {
        let devices = self.devices.lock().unwrap();
        let mut out = String::new();
        for (serial, device) in devices.iter() {
            out.push_str(serial);
            out.push('\t');
            out.push_str(device.status.label());
            out.push('\n');
        }
        out.into_bytes()
    }

    /// `None` once the device is gone.
    fn pid_list_payload(&self, serial: &str) -> Option<Vec<u8>> {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(serial)?;
        let mut out = String::new();
        for pid in device.clients.keys() {
            out.push_str(&pid.to_string());
            out.push('\n');
        }
        Some(out.into_bytes())
    }
}

/// The fake daemon. Dropping it leaves the listener task running until
/// [`shutdown`](FakeAdbServer::shutdown) or process exit; tests normally call
/// `shutdown` explicitly when they care.
pub struct FakeAdbServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FakeAdbServer {
    pub async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (epoch, _) = watch::channel(0);
        let state = Arc::new(ServerState {
            devices: Mutex::new(BTreeMap::new()),
            epoch,
            shutdown: CancellationToken::new(),
            next_transport_id: AtomicU64::new(1),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_state.shutdown.cancelled() => break,
                    res = listener.accept() => res,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(serve_connection(accept_state.clone(), stream));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A [`HostServices`] pointed at this fake, with short timeouts suitable
    /// for tests.
    pub fn host_services(&self) -> HostServices {
        HostServices::with_config(
            self.addr,
            HostServicesConfig {
                connect_timeout: Duration::from_secs(5),
                io_timeout: Duration::from_secs(5),
            },
        )
    }

    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
        let mut devices = self.state.devices.lock().unwrap();
        for device in devices.values() {
            device.scope.cancel();
        }
        devices.clear();
    }

    /// Add a device in the `Online` state with a default stable board serial
    /// of `board-<serial>`.
    pub fn connect_device(&self, serial: &str) {
        let board_serial = format!("board-{serial}");
        self.connect_device_with_props(serial, &[("ro.serialno", board_serial.as_str())]);
    }

    pub fn connect_device_with_props(&self, serial: &str, props: &[(&str, &str)]) {
        let transport_id = self.state.next_transport_id.fetch_add(1, Ordering::Relaxed);
        let mut devices = self.state.devices.lock().unwrap();
        devices.insert(
            serial.to_string(),
            FakeDevice {
                status: FakeDeviceStatus::Online,
                props: props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                transport_id,
                clients: BTreeMap::new(),
                scope: CancellationToken::new(),
                track_jdwp_generation: CancellationToken::new(),
                fail_next_track_jdwp: false,
            },
        );
        drop(devices);
        self.state.notify();
    }

    pub fn set_device_state(&self, serial: &str, status: FakeDeviceStatus) {
        let mut devices = self.state.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(serial) {
            device.status = status;
        }
        drop(devices);
        self.state.notify();
    }

    /// Remove the device and kill every open service connection scoped to it.
    pub fn disconnect_device(&self, serial: &str) {
        let removed = self.state.devices.lock().unwrap().remove(serial);
        if let Some(device) = removed {
            device.scope.cancel();
            for client in device.clients.values() {
                client.token.cancel();
            }
        }
        self.state.notify();
    }

    pub fn start_client(&self, serial: &str, pid: u32, process_name: &str) {
        let mut devices = self.state.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(serial) {
            let (inject, _) = broadcast::channel(16);
            device.clients.insert(
                pid,
                FakeClient {
                    process_name: process_name.to_string(),
                    token: CancellationToken::new(),
                    inject,
                },
            );
        }
        drop(devices);
        self.state.notify();
    }

    pub fn stop_client(&self, serial: &str, pid: u32) {
        let mut devices = self.state.devices.lock().unwrap();
        let removed = devices
            .get_mut(serial)
            .and_then(|device| device.clients.remove(&pid));
        drop(devices);
        if let Some(client) = removed {
            client.token.cancel();
        }
        self.state.notify();
    }

    /// Force an EOF on live `track-jdwp` streams for `serial` while the
    /// device stays connected (the "daemon closed the stream cleanly" case).
    pub fn end_track_jdwp_streams(&self, serial: &str) {
        let mut devices = self.state.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(serial) {
            let generation =
                std::mem::replace(&mut device.track_jdwp_generation, CancellationToken::new());
            generation.cancel();
        }
    }

    /// Make the next `track-jdwp` request for `serial` fail with an explicit
    /// FAIL response (a daemon fault, not a clean stream end).
    pub fn fail_next_track_jdwp(&self, serial: &str) {
        let mut devices = self.state.devices.lock().unwrap();
        if let Some(device) = devices.get_mut(serial) {
            device.fail_next_track_jdwp = true;
        }
    }

    /// Have the fake VM for `serial`/`pid` emit an unsolicited DDMS command
    /// packet on every open JDWP connection (e.g. an `APNM` rename).
    pub fn send_client_ddms_chunk(&self, serial: &str, pid: u32, chunk: DdmsChunk) {
        let devices = self.state.devices.lock().unwrap();
        if let Some(client) = devices.get(serial).and_then(|d| d.clients.get(&pid)) {
            let id = NEXT_VM_PACKET_ID.fetch_add(1, Ordering::Relaxed);
            let _ = client.inject.send(chunk.into_command_packet(id));
        }
    }
}

/// Poll `cond` until it holds, with a generous overall deadline. Test-suite
/// equivalent of suspending until observable state catches up.
pub async fn yield_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn serve_connection(state: Arc<ServerState>, mut stream: TcpStream) {
    let mut selected: Option<String> = None;
    loop {
        let service = match read_service_request(&mut stream).await {
            Ok(service) => service,
            Err(_) => return,
        };

        if let Some(serial) = selected.clone() {
            serve_device_service(&state, stream, &serial, &service).await;
            return;
        }

        match service.as_str() {
            "host:devices" => {
                if write_okay(&mut stream).await.is_err() {
                    return;
                }
                let payload = state.device_list_payload();
                let _ = write_frame(&mut stream, &payload).await;
                return;
            }
            "host:track-devices" => {
                if write_okay(&mut stream).await.is_err() {
                    return;
                }
                serve_track_devices(&state, &mut stream).await;
                return;
            }
            other => match resolve_transport(&state, other) {
                Some(Ok((serial, transport_id))) => {
                    if write_okay(&mut stream).await.is_err() {
                        return;
                    }
                    if let Some(id) = transport_id {
                        if stream.write_all(&id.to_le_bytes()).await.is_err() {
                            return;
                        }
                    }
                    selected = Some(serial);
                }
                Some(Err(message)) => {
                    let _ = write_fail(&mut stream, &message).await;
                    return;
                }
                None => {
                    let _ = write_fail(&mut stream, &format!("unknown host service {other}")).await;
                    return;
                }
            },
        }
    }
}

/// `Some(Ok)` = transport selected; `Some(Err)` = FAIL with message; `None` =
/// not a transport service at all.
fn resolve_transport(
    state: &ServerState,
    service: &str,
) -> Option<Result<(String, Option<u64>), String>> {
    let (target, with_id) = if let Some(rest) = service.strip_prefix("host:tport:") {
        (rest.to_string(), true)
    } else if let Some(rest) = service.strip_prefix("host:transport-id:") {
        (format!("id:{rest}"), false)
    } else if let Some(rest) = service.strip_prefix("host:transport:") {
        (format!("serial:{rest}"), false)
    } else if let Some(rest) = service.strip_prefix("host:transport-") {
        (rest.to_string(), false)
    } else {
        return None;
    };

    let devices = state.devices.lock().unwrap();
    let found = match target.as_str() {
        "any" => devices
            .iter()
            .find(|(_, d)| d.status == FakeDeviceStatus::Online),
        "usb" => devices
            .iter()
            .find(|(s, d)| d.status == FakeDeviceStatus::Online && !s.starts_with("emulator-")),
        "local" => devices
            .iter()
            .find(|(s, d)| d.status == FakeDeviceStatus::Online && s.starts_with("emulator-")),
        _ => {
            if let Some(serial) = target.strip_prefix("serial:") {
                match devices.get(serial) {
                    None => return Some(Err(format!("device '{serial}' not found"))),
                    Some(d) if d.status == FakeDeviceStatus::Unauthorized => {
                        return Some(Err("device unauthorized".to_string()))
                    }
                    Some(d) if d.status == FakeDeviceStatus::Offline => {
                        return Some(Err("device offline".to_string()))
                    }
                    Some(_) => devices.iter().find(|(s, _)| s.as_str() == serial),
                }
            } else if let Some(id) = target.strip_prefix("id:") {
                let id: u64 = match id.parse() {
                    Ok(id) => id,
                    Err(_) => return Some(Err(format!("invalid transport id {id}"))),
                };
                devices.iter().find(|(_, d)| d.transport_id == id)
            } else {
                return Some(Err(format!("unknown transport target {target}")));
            }
        }
    };

    match found {
        Some((serial, device)) => {
            let id = with_id.then_some(device.transport_id);
            Some(Ok((serial.clone(), id)))
        }
        None => Some(Err("no devices/emulators found".to_string())),
    }
}

async fn serve_device_service(
    state: &Arc<ServerState>,
    mut stream: TcpStream,
    serial: &str,
    service: &str,
) {
    match service {
        "track-jdwp" => {
            let fail = {
                let mut devices = state.devices.lock().unwrap();
                devices
                    .get_mut(serial)
                    .map(|device| std::mem::take(&mut device.fail_next_track_jdwp))
            };
            let Some(fail) = fail else {
                let _ = write_fail(&mut stream, &format!("device '{serial}' not found")).await;
                return;
            };
            if fail {
                let _ = write_fail(&mut stream, "track-jdwp unavailable").await;
                return;
            }
            if write_okay(&mut stream).await.is_err() {
                return;
            }
            serve_track_jdwp(state, &mut stream, serial).await;
        }
        other if other.starts_with("jdwp:") => {
            let pid: u32 = match other["jdwp:".len()..].parse() {
                Ok(pid) => pid,
                Err(_) => {
                    let _ = write_fail(&mut stream, "invalid pid").await;
                    return;
                }
            };
            let client = {
                let devices = state.devices.lock().unwrap();
                devices.get(serial).and_then(|d| {
                    d.clients.get(&pid).map(|c| {
                        (
                            d.scope.clone(),
                            c.token.clone(),
                            c.process_name.clone(),
                            c.inject.subscribe(),
                        )
                    })
                })
            };
            match client {
                Some((scope, token, process_name, inject)) => {
                    if write_okay(&mut stream).await.is_err() {
                        return;
                    }
                    serve_jdwp_vm(state, stream, pid, process_name, scope, token, inject).await;
                }
                None => {
                    let _ = write_fail(&mut stream, &format!("process {pid} not debuggable")).await;
                }
            }
        }
        other if other.starts_with("shell:") => {
            if write_okay(&mut stream).await.is_err() {
                return;
            }
            let output = shell_output(state, serial, &other["shell:".len()..]);
            let _ = stream.write_all(output.as_bytes()).await;
            // Dropping the connection is the shell's EOF.
        }
        other => {
            let _ = write_fail(&mut stream, &format!("unknown device service {other}")).await;
        }
    }
}

fn shell_output(state: &ServerState, serial: &str, command: &str) -> String {
    let devices = state.devices.lock().unwrap();
    let Some(device) = devices.get(serial) else {
        return String::new();
    };
    if let Some(name) = command.strip_prefix("getprop ") {
        let value = device.props.get(name.trim()).cloned().unwrap_or_default();
        return format!("{value}\n");
    }
    String::new()
}

async fn serve_track_devices(state: &Arc<ServerState>, stream: &mut TcpStream) {
    let mut epoch = state.epoch.subscribe();
    let mut last: Option<Vec<u8>> = None;
    loop {
        let payload = state.device_list_payload();
        if last.as_deref() != Some(payload.as_slice()) {
            if write_frame(stream, &payload).await.is_err() {
                return;
            }
            last = Some(payload);
        }
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            changed = epoch.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn serve_track_jdwp(state: &Arc<ServerState>, stream: &mut TcpStream, serial: &str) {
    let (scope, generation) = {
        let devices = state.devices.lock().unwrap();
        match devices.get(serial) {
            Some(device) => (device.scope.clone(), device.track_jdwp_generation.clone()),
            None => return,
        }
    };
    let mut epoch = state.epoch.subscribe();
    let mut last: Option<Vec<u8>> = None;
    loop {
        let Some(payload) = state.pid_list_payload(serial) else {
            return;
        };
        if last.as_deref() != Some(payload.as_slice()) {
            if write_frame(stream, &payload).await.is_err() {
                return;
            }
            last = Some(payload);
        }
        tokio::select! {
            _ = state.shutdown.cancelled() => return,
            _ = scope.cancelled() => return,
            _ = generation.cancelled() => return,
            changed = epoch.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn serve_jdwp_vm(
    state: &Arc<ServerState>,
    mut stream: TcpStream,
    pid: u32,
    process_name: String,
    scope: CancellationToken,
    token: CancellationToken,
    mut inject: broadcast::Receiver<JdwpPacket>,
) {
    if accept_handshake(&mut stream, Duration::from_secs(5))
        .await
        .is_err()
    {
        return;
    }
    let (mut reader, mut writer) = stream.into_split();

    // Packet reads must not race the injected-packet writes, so a dedicated
    // task turns incoming commands into replies and the loop below owns the
    // write half.
    let (replies_tx, mut replies) = mpsc::channel::<JdwpPacket>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            match JdwpPacket::read_from(&mut reader, MAX_PACKET_LEN).await {
                Ok(packet) => {
                    if packet.is_reply() {
                        continue;
                    }
                    let reply = vm_reply(&packet, pid, &process_name);
                    if replies_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = scope.cancelled() => break,
            _ = token.cancelled() => break,
            injected = inject.recv() => {
                match injected {
                    Ok(packet) => {
                        if packet.write_to(&mut writer).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            reply = replies.recv() => {
                match reply {
                    Some(packet) => {
                        if packet.write_to(&mut writer).await.is_err() {
                            break;
                        }
                    }
                    // The peer closed the connection.
                    None => break,
                }
            }
        }
    }
    reader_task.abort();
}

fn vm_reply(packet: &JdwpPacket, pid: u32, process_name: &str) -> JdwpPacket {
    if tether_jdwp::ddms::is_ddms_command(packet) {
        for chunk in chunks(&packet.payload).flatten() {
            if chunk.chunk_type == DdmsChunkType::HELO {
                let helo = HeloData {
                    version: FAKE_VM_VERSION,
                    pid,
                    vm_identifier: FAKE_VM_IDENT.to_string(),
                    process_name: process_name.to_string(),
                };
                return helo.encode_reply_chunk().into_reply_packet(packet.id);
            }
        }
    }
    // Everything else gets an empty success reply with the echoed id.
    JdwpPacket::reply(packet.id, 0, Vec::new())
}

async fn read_service_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let text = std::str::from_utf8(&prefix)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length prefix"))?;
    let length = usize::from_str_radix(text, 16)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad length prefix"))?;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;
    String::from_utf8(payload)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad service string"))
}

async fn write_okay(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(b"OKAY").await
}

async fn write_fail(stream: &mut TcpStream, message: &str) -> std::io::Result<()> {
    stream.write_all(b"FAIL").await?;
    write_frame(stream, message.as_bytes()).await
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let prefix = format!("{:04X}", payload.len());
    stream.write_all(prefix.as_bytes()).await?;
    stream.write_all(payload).await
}
