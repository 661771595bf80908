//! The per-device `track-jdwp` loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_adb::{AdbError, DeviceHandle, DeviceState, HostServices};

use crate::process::JdwpProcess;
use crate::process_map::ProcessMap;
use crate::{DebugError, Result};

/// Backoff before re-opening `track-jdwp` after the daemon closed the stream
/// while the device remained connected.
pub const TRACK_JDWP_RETRY_DELAY: Duration = Duration::from_secs(2);

struct TrackerInner {
    services: HostServices,
    device: DeviceHandle,
    processes: watch::Sender<Vec<JdwpProcess>>,
    shutdown: CancellationToken,
}

/// Tracks the set of debuggable processes on one connected device.
///
/// The tracker owns its process map exclusively; observers see published
/// immutable snapshots through [`processes`](JdwpProcessTracker::processes),
/// delivered in the order the daemon reported them.
pub struct JdwpProcessTracker {
    inner: Arc<TrackerInner>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl JdwpProcessTracker {
    pub fn start(services: HostServices, device: DeviceHandle) -> Self {
        let (processes, _) = watch::channel(Vec::new());
        let inner = Arc::new(TrackerInner {
            services,
            device,
            processes,
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(track_processes(inner.clone()));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.inner.device
    }

    /// Live snapshot of tracked processes for this device.
    pub fn processes(&self) -> watch::Receiver<Vec<JdwpProcess>> {
        self.inner.processes.subscribe()
    }

    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait for the tracking loop to end and surface its outcome: `Ok` after
    /// a clean device disconnect, [`DebugError::Cancelled`] after
    /// [`close`](JdwpProcessTracker::close), or the fatal protocol error that
    /// stopped it.
    pub async fn join(&self) -> Result<()> {
        let task = self.task.lock().unwrap().take();
        match task {
            Some(task) => task.await.unwrap_or(Err(DebugError::Cancelled)),
            None => Ok(()),
        }
    }
}

enum Decision {
    Retry,
    Stop,
}

async fn track_processes(inner: Arc<TrackerInner>) -> Result<()> {
    let mut map = ProcessMap::new();
    let mut device_state = inner.device.state();

    let result = run_tracking(&inner, &mut map, &mut device_state).await;

    // Cleanup runs on every exit path, including cancellation racing an
    // in-flight read: the map is cleared and the public list goes empty.
    map.clear();
    inner.processes.send_replace(Vec::new());
    match &result {
        Ok(()) => {
            tracing::debug!(
                target: "tether.debug",
                serial = %inner.device.serial(),
                "process tracking ended"
            );
        }
        Err(DebugError::Cancelled) => {
            tracing::debug!(
                target: "tether.debug",
                serial = %inner.device.serial(),
                "process tracking cancelled"
            );
        }
        Err(err) => {
            tracing::warn!(
                target: "tether.debug",
                serial = %inner.device.serial(),
                error = %err,
                "process tracking failed"
            );
        }
    }
    result
}

async fn run_tracking(
    inner: &Arc<TrackerInner>,
    map: &mut ProcessMap<JdwpProcess>,
    device_state: &mut watch::Receiver<DeviceState>,
) -> Result<()> {
    loop {
        let selector = inner.device.selector();
        let opened = tokio::select! {
            _ = inner.shutdown.cancelled() => return Err(DebugError::Cancelled),
            _ = device_disconnected(device_state) => return Ok(()),
            res = inner.services.track_jdwp(&selector) => res,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => match classify_failure(inner, device_state, err)? {
                Decision::Retry => {
                    publish_empty(inner, map);
                    backoff(inner).await?;
                    continue;
                }
                Decision::Stop => return Ok(()),
            },
        };

        loop {
            let frame = tokio::select! {
                _ = inner.shutdown.cancelled() => return Err(DebugError::Cancelled),
                _ = device_disconnected(device_state) => return Ok(()),
                res = stream.next_pids() => res,
            };
            match frame {
                Ok(pids) => {
                    tracing::debug!(
                        target: "tether.debug",
                        serial = %inner.device.serial(),
                        ?pids,
                        "received process list"
                    );
                    map.update(&pids, |pid| {
                        tracing::debug!(
                            target: "tether.debug",
                            serial = %inner.device.serial(),
                            pid,
                            "process appeared"
                        );
                        let process =
                            JdwpProcess::new(inner.services.clone(), inner.device.clone(), pid);
                        process.start_monitoring();
                        process
                    });
                    inner.processes.send_replace(map.values().cloned().collect());
                }
                Err(err) => match classify_failure(inner, device_state, err)? {
                    Decision::Retry => {
                        publish_empty(inner, map);
                        backoff(inner).await?;
                        break;
                    }
                    Decision::Stop => return Ok(()),
                },
            }
        }
    }
}

/// Typed decision at each stream failure: clean EOF while the device is still
/// connected is transient and retried after a delay; a failure observed after
/// the device disconnected ends the loop cleanly; anything else is a genuine
/// daemon/protocol fault and propagates.
fn classify_failure(
    inner: &TrackerInner,
    device_state: &watch::Receiver<DeviceState>,
    err: AdbError,
) -> Result<Decision> {
    if *device_state.borrow() != DeviceState::Online {
        tracing::debug!(
            target: "tether.debug",
            serial = %inner.device.serial(),
            "process tracking ending because device disconnected"
        );
        return Ok(Decision::Stop);
    }
    match err {
        AdbError::ConnectionClosed => {
            tracing::info!(
                target: "tether.debug",
                serial = %inner.device.serial(),
                "track-jdwp ended with expected end-of-stream, retrying"
            );
            Ok(Decision::Retry)
        }
        err => Err(err.into()),
    }
}

/// While the daemon is unreachable the device has no known processes.
fn publish_empty(inner: &TrackerInner, map: &mut ProcessMap<JdwpProcess>) {
    map.update(&[], |_| unreachable!("empty pid set never creates entries"));
    inner.processes.send_replace(Vec::new());
}

async fn backoff(inner: &TrackerInner) -> Result<()> {
    tokio::select! {
        _ = inner.shutdown.cancelled() => Err(DebugError::Cancelled),
        _ = tokio::time::sleep(TRACK_JDWP_RETRY_DELAY) => Ok(()),
    }
}

/// Resolves when the device leaves the `Online` state; pending while it stays
/// connected.
async fn device_disconnected(state: &mut watch::Receiver<DeviceState>) {
    loop {
        if *state.borrow_and_update() != DeviceState::Online {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}
