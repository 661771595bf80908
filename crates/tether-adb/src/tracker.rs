//! Device tracking and provisioning.
//!
//! The raw `host:track-devices` feed names devices by transient serial. This
//! module turns those snapshots into stable [`DeviceHandle`]s: a physical
//! device that replugs under a new transport maps back to the same handle
//! (matched by a stable identity resolved from device properties), while a
//! different device reusing a vacated serial slot does not.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::host::{HostServices, RawDeviceInfo, RawDeviceState, TransportId};
use crate::selector::DeviceSelector;
use crate::{AdbError, Result};

/// Delay before re-opening `host:track-devices` after losing the daemon
/// connection.
const TRACK_DEVICES_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Deadline for the property queries used to resolve a device's identity.
const IDENTITY_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Unauthorized,
    Disconnected,
}

/// Stable key recognizing "the same device" across reconnects, independent of
/// transient serial/transport numbering.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    fn hardware(board_serial: &str) -> Self {
        Self(format!("hw:{board_serial}"))
    }

    fn emulator(avd_name: &str) -> Self {
        Self(format!("avd:{avd_name}"))
    }

    /// Fallback key derived from the transient serial, used when the device
    /// cannot answer property queries (unauthorized, or the query failed).
    fn provisional(serial: &str) -> Self {
        Self(format!("serial:{serial}"))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with("serial:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct HandleInner {
    identity: Mutex<IdentityKey>,
    serial: Mutex<String>,
    transport_id: Mutex<Option<TransportId>>,
    state: watch::Sender<DeviceState>,
    /// Cancelled when the current connected incarnation ends; replaced on
    /// reconnect.
    connection: Mutex<CancellationToken>,
}

/// One device across its connected lifetime.
///
/// The handle persists across disconnect/reconnect of the same device; its
/// state transitions instead of the handle being recreated. At most one live
/// handle exists per identity key.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl DeviceHandle {
    fn new(identity: IdentityKey, serial: String, transport_id: Option<TransportId>, state: DeviceState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(HandleInner {
                identity: Mutex::new(identity),
                serial: Mutex::new(serial),
                transport_id: Mutex::new(transport_id),
                state: state_tx,
                connection: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn identity(&self) -> IdentityKey {
        self.inner.identity.lock().unwrap().clone()
    }

    /// The serial the device is currently (or was last) known by. May change
    /// across reconnects of the same handle.
    pub fn serial(&self) -> String {
        self.inner.serial.lock().unwrap().clone()
    }

    pub fn transport_id(&self) -> Option<TransportId> {
        *self.inner.transport_id.lock().unwrap()
    }

    pub fn state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> DeviceState {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current_state() == DeviceState::Online
    }

    /// Token cancelled when the current connected incarnation ends. Tasks
    /// scoped to "this device, while connected" tie themselves to it.
    pub fn connection_token(&self) -> CancellationToken {
        self.inner.connection.lock().unwrap().clone()
    }

    /// Selector addressing the device through its current serial.
    pub fn selector(&self) -> DeviceSelector {
        DeviceSelector::serial(self.serial())
    }

    fn set_state(&self, state: DeviceState) {
        self.inner.state.send_replace(state);
    }

    fn set_disconnected(&self) {
        tracing::info!(
            target: "tether.adb",
            serial = %self.serial(),
            identity = %self.identity(),
            "device disconnected"
        );
        self.inner.state.send_replace(DeviceState::Disconnected);
        self.inner.connection.lock().unwrap().cancel();
    }

    fn reconnect(&self, serial: &str, transport_id: Option<TransportId>, state: DeviceState) {
        tracing::info!(
            target: "tether.adb",
            serial,
            identity = %self.identity(),
            "device reconnected"
        );
        *self.inner.serial.lock().unwrap() = serial.to_string();
        *self.inner.transport_id.lock().unwrap() = transport_id;
        *self.inner.connection.lock().unwrap() = CancellationToken::new();
        self.inner.state.send_replace(state);
    }

    fn set_identity(&self, identity: IdentityKey) {
        *self.inner.identity.lock().unwrap() = identity;
    }

    /// True when both values refer to the same underlying handle.
    pub fn same_handle(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("serial", &self.serial())
            .field("identity", &self.identity().as_str())
            .field("state", &self.current_state())
            .finish()
    }
}

struct TrackerInner {
    services: HostServices,
    devices: watch::Sender<Vec<DeviceHandle>>,
    shutdown: CancellationToken,
}

/// Runs the `host:track-devices` loop and provisions handles.
#[derive(Clone)]
pub struct DeviceTracker {
    inner: Arc<TrackerInner>,
}

impl DeviceTracker {
    pub fn start(services: HostServices) -> Self {
        let (devices, _) = watch::channel(Vec::new());
        let inner = Arc::new(TrackerInner {
            services,
            devices,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(track_devices_loop(inner.clone()));
        Self { inner }
    }

    /// Current set of known handles, live and disconnected. Handles are only
    /// dropped when the tracker shuts down.
    pub fn devices(&self) -> watch::Receiver<Vec<DeviceHandle>> {
        self.inner.devices.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Suspend until a handle matching `selector` is `Online`, or fail with
    /// [`AdbError::Timeout`]. The timeout only fails this caller; tracking
    /// continues undisturbed.
    pub async fn wait_for_device(
        &self,
        selector: &DeviceSelector,
        timeout: Duration,
    ) -> Result<DeviceHandle> {
        let mut rx = self.devices();
        let wait = async move {
            loop {
                let found = rx
                    .borrow_and_update()
                    .iter()
                    .find(|handle| handle.is_online() && selector_matches(selector, handle))
                    .cloned();
                if let Some(handle) = found {
                    return Ok(handle);
                }
                if rx.changed().await.is_err() {
                    return Err(AdbError::Cancelled);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AdbError::Timeout)?
    }
}

fn selector_matches(selector: &DeviceSelector, handle: &DeviceHandle) -> bool {
    if let Some(serial) = selector.serial_number() {
        return handle.serial() == serial;
    }
    if let Some(id) = selector.transport_id_value() {
        return handle.transport_id() == Some(id);
    }
    let is_emulator = handle.serial().starts_with("emulator-");
    match selector.transport_service().as_str() {
        "host:transport-usb" | "host:tport:usb" => !is_emulator,
        "host:transport-local" | "host:tport:local" => is_emulator,
        _ => true,
    }
}

async fn track_devices_loop(inner: Arc<TrackerInner>) {
    let mut handles: Vec<DeviceHandle> = Vec::new();
    loop {
        let stream = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = inner.services.track_devices() => res,
        };
        match stream {
            Ok(mut stream) => loop {
                let snapshot = tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        shutdown_handles(&inner, &mut handles);
                        return;
                    }
                    res = stream.next_snapshot() => res,
                };
                match snapshot {
                    Ok(list) => {
                        apply_snapshot(&inner, &mut handles, list).await;
                    }
                    Err(err) => {
                        tracing::info!(
                            target: "tether.adb",
                            error = %err,
                            "device tracking stream ended, retrying"
                        );
                        break;
                    }
                }
            },
            Err(err) => {
                tracing::warn!(
                    target: "tether.adb",
                    error = %err,
                    "cannot open device tracking stream, retrying"
                );
            }
        }

        // The daemon connection is gone, so device states are unknown until
        // the stream resyncs. Everything is reported disconnected meanwhile.
        for handle in &handles {
            if handle.current_state() != DeviceState::Disconnected {
                handle.set_disconnected();
            }
        }
        inner.devices.send_replace(handles.clone());

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(TRACK_DEVICES_RETRY_DELAY) => {}
        }
    }
    shutdown_handles(&inner, &mut handles);
}

fn shutdown_handles(inner: &TrackerInner, handles: &mut Vec<DeviceHandle>) {
    for handle in handles.iter() {
        if handle.current_state() != DeviceState::Disconnected {
            handle.set_disconnected();
        }
    }
    handles.clear();
    inner.devices.send_replace(Vec::new());
}

async fn apply_snapshot(
    inner: &TrackerInner,
    handles: &mut Vec<DeviceHandle>,
    list: Vec<RawDeviceInfo>,
) {
    // Devices reported offline (or in an unknown state) are not usable and
    // are treated as absent.
    let usable: Vec<(String, DeviceState)> = list
        .into_iter()
        .filter_map(|info| match info.state {
            RawDeviceState::Online => Some((info.serial, DeviceState::Online)),
            RawDeviceState::Unauthorized => Some((info.serial, DeviceState::Unauthorized)),
            RawDeviceState::Offline | RawDeviceState::Other(_) => None,
        })
        .collect();

    // Serials that vanished since the last snapshot.
    for handle in handles.iter() {
        if handle.current_state() != DeviceState::Disconnected
            && !usable.iter().any(|(serial, _)| *serial == handle.serial())
        {
            handle.set_disconnected();
        }
    }

    for (serial, state) in usable {
        let live = handles
            .iter()
            .find(|h| h.serial() == serial && h.current_state() != DeviceState::Disconnected)
            .cloned();
        match live {
            Some(handle) => {
                let previous = handle.current_state();
                if previous == state {
                    continue;
                }
                if previous == DeviceState::Unauthorized && state == DeviceState::Online {
                    // Authorization completed: same device, same transport.
                    // Its identity can finally be resolved.
                    complete_authorization(inner, handles, &handle, &serial).await;
                } else {
                    handle.set_state(state);
                }
            }
            None => {
                provision_new_transport(inner, handles, &serial, state).await;
            }
        }
    }

    inner.devices.send_replace(handles.clone());
}

/// A serial appeared that no live handle owns: resolve identity first, then
/// reuse the disconnected handle it matches, or create a fresh one.
async fn provision_new_transport(
    inner: &TrackerInner,
    handles: &mut Vec<DeviceHandle>,
    serial: &str,
    state: DeviceState,
) {
    let (identity, transport_id) = if state == DeviceState::Online {
        resolve_identity(&inner.services, serial).await
    } else {
        // Unauthorized devices cannot answer property queries yet.
        (IdentityKey::provisional(serial), None)
    };

    if let Some(existing) = handles.iter().find(|h| h.identity() == identity).cloned() {
        if existing.current_state() == DeviceState::Disconnected {
            existing.reconnect(serial, transport_id, state);
            return;
        }
        // Two usable transports claiming one identity should not happen;
        // keep the invariant by giving the newcomer a distinct key.
        tracing::warn!(
            target: "tether.adb",
            serial,
            identity = %identity,
            "identity already claimed by a live handle, keeping devices separate"
        );
        let handle = DeviceHandle::new(IdentityKey::provisional(serial), serial.to_string(), transport_id, state);
        handles.push(handle);
        return;
    }

    tracing::info!(target: "tether.adb", serial, identity = %identity, ?state, "device connected");
    handles.push(DeviceHandle::new(
        identity,
        serial.to_string(),
        transport_id,
        state,
    ));
}

/// An unauthorized handle just came online. Resolve its real identity: if a
/// disconnected handle already owns it, that durable handle resumes (and the
/// provisional one ends); otherwise the provisional handle is re-keyed.
async fn complete_authorization(
    inner: &TrackerInner,
    handles: &mut Vec<DeviceHandle>,
    handle: &DeviceHandle,
    serial: &str,
) {
    let (identity, transport_id) = resolve_identity(&inner.services, serial).await;

    let durable = handles
        .iter()
        .find(|h| !h.same_handle(handle) && h.identity() == identity)
        .cloned();
    match durable {
        Some(durable) if durable.current_state() == DeviceState::Disconnected => {
            durable.reconnect(serial, transport_id, DeviceState::Online);
            handle.set_disconnected();
            let provisional = handle.clone();
            handles.retain(|h| !h.same_handle(&provisional));
        }
        _ => {
            handle.set_identity(identity);
            *handle.inner.transport_id.lock().unwrap() = transport_id;
            handle.set_state(DeviceState::Online);
        }
    }
}

/// Resolve a device's stable identity from its properties: AVD name for
/// emulators, board serial for hardware, transient serial as a last resort.
async fn resolve_identity(
    services: &HostServices,
    serial: &str,
) -> (IdentityKey, Option<TransportId>) {
    let selector = DeviceSelector::serial(serial).with_transport_id_tracking();

    let (avd_name, transport_id) =
        match query_prop(services, &selector, "ro.boot.qemu.avd_name").await {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(
                    target: "tether.adb",
                    serial,
                    error = %err,
                    "identity query failed, falling back to transient serial"
                );
                return (IdentityKey::provisional(serial), None);
            }
        };
    if !avd_name.is_empty() {
        return (IdentityKey::emulator(&avd_name), transport_id);
    }

    match query_prop(services, &selector, "ro.serialno").await {
        Ok((board_serial, transport_id)) if !board_serial.is_empty() => {
            (IdentityKey::hardware(&board_serial), transport_id)
        }
        Ok((_, transport_id)) => (IdentityKey::provisional(serial), transport_id),
        Err(err) => {
            tracing::debug!(
                target: "tether.adb",
                serial,
                error = %err,
                "identity query failed, falling back to transient serial"
            );
            (IdentityKey::provisional(serial), transport_id)
        }
    }
}

async fn query_prop(
    services: &HostServices,
    selector: &DeviceSelector,
    name: &str,
) -> Result<(String, Option<TransportId>)> {
    let query = async {
        let service = format!("shell:getprop {name}");
        let (mut channel, transport_id) = services.open_device_service(selector, &service).await?;
        let output = services.read_to_eof(&mut channel).await?;
        Ok((
            String::from_utf8_lossy(&output).trim().to_string(),
            transport_id,
        ))
    };
    tokio::time::timeout(IDENTITY_QUERY_TIMEOUT, query)
        .await
        .map_err(|_| AdbError::Timeout)?
}
