//! One tracked debuggable process.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tether_adb::{DeviceHandle, HostServices};
use tether_jdwp::ddms::{DdmsChunk, DdmsChunkType, DdmsChunkView, HeloData};

use crate::process_map::Release;
use crate::proxy::{JdwpSessionProxy, ProxyStatus};

/// Version advertised in the `HELO` query sent to the process's DDM server.
const DDMS_PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JdwpProcessProperties {
    pub pid: u32,
    /// Process (application) name from the DDMS `HELO` exchange.
    pub process_name: Option<String>,
    /// VM identifier string from the DDMS `HELO` exchange.
    pub vm_identifier: Option<String>,
    /// True once DDMS introspection finished, successfully or not.
    pub completed: bool,
}

struct ProcessInner {
    pid: u32,
    device: DeviceHandle,
    proxy: JdwpSessionProxy,
    properties: watch::Sender<JdwpProcessProperties>,
    shutdown: CancellationToken,
}

/// A debuggable process on a connected device.
///
/// Created by the process tracker when the pid is first reported; released
/// when the pid stops being reported or the device disconnects.
#[derive(Clone)]
pub struct JdwpProcess {
    inner: Arc<ProcessInner>,
}

impl JdwpProcess {
    pub fn new(services: HostServices, device: DeviceHandle, pid: u32) -> Self {
        let (properties, _) = watch::channel(JdwpProcessProperties {
            pid,
            ..Default::default()
        });
        let proxy = JdwpSessionProxy::new(services, device.clone(), pid);
        Self {
            inner: Arc::new(ProcessInner {
                pid,
                device,
                proxy,
                properties,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.inner.device
    }

    pub fn properties(&self) -> watch::Receiver<JdwpProcessProperties> {
        self.inner.properties.subscribe()
    }

    pub fn proxy(&self) -> &JdwpSessionProxy {
        &self.inner.proxy
    }

    pub fn proxy_status(&self) -> watch::Receiver<ProxyStatus> {
        self.inner.proxy.status()
    }

    /// Start the session proxy and the one-shot DDMS introspection that
    /// recovers the process name.
    pub fn start_monitoring(&self) {
        self.inner.proxy.start();
        tokio::spawn(collect_properties(self.inner.clone()));
    }

    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.proxy.close();
    }
}

impl Release for JdwpProcess {
    fn release(&self) {
        tracing::debug!(
            target: "tether.debug",
            pid = self.inner.pid,
            "releasing tracked process"
        );
        self.close();
    }
}

impl std::fmt::Debug for JdwpProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdwpProcess")
            .field("pid", &self.inner.pid)
            .field("serial", &self.inner.device.serial())
            .finish()
    }
}

async fn collect_properties(inner: Arc<ProcessInner>) {
    let helo = DdmsChunk::new(
        DdmsChunkType::HELO,
        DDMS_PROTOCOL_VERSION.to_be_bytes().to_vec(),
    );
    let reply = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        res = inner.proxy.send_ddms_command(helo) => res,
    };
    match reply {
        Ok(packet) => match DdmsChunkView::parse(&packet.payload) {
            Ok(chunk) if chunk.chunk_type == DdmsChunkType::HELO => {
                match HeloData::decode(chunk.payload) {
                    Ok(helo) => {
                        tracing::debug!(
                            target: "tether.debug",
                            pid = inner.pid,
                            process_name = %helo.process_name,
                            vm = %helo.vm_identifier,
                            "received process metadata"
                        );
                        inner.properties.send_modify(|props| {
                            props.process_name = Some(helo.process_name.clone());
                            props.vm_identifier = Some(helo.vm_identifier.clone());
                        });
                    }
                    Err(err) => {
                        tracing::debug!(
                            target: "tether.debug",
                            pid = inner.pid,
                            error = %err,
                            "malformed HELO reply"
                        );
                    }
                }
            }
            Ok(chunk) => {
                tracing::debug!(
                    target: "tether.debug",
                    pid = inner.pid,
                    chunk = %chunk.chunk_type,
                    "unexpected chunk in HELO reply"
                );
            }
            Err(err) => {
                tracing::debug!(
                    target: "tether.debug",
                    pid = inner.pid,
                    error = %err,
                    "malformed HELO reply payload"
                );
            }
        },
        Err(err) => {
            tracing::debug!(
                target: "tether.debug",
                pid = inner.pid,
                error = %err,
                "DDMS introspection failed"
            );
        }
    }
    inner.properties.send_modify(|props| props.completed = true);
}
