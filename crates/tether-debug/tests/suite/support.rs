use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use tether_adb::fake::FakeAdbServer;
use tether_adb::{DeviceHandle, DeviceSelector, DeviceTracker, HostServices};
use tether_debug::JdwpProcess;
use tether_jdwp::{JdwpPacket, JdwpSession, JdwpSessionConfig};

pub use tether_adb::fake::yield_until;

/// A fake daemon plus a running device tracker.
pub struct TestRig {
    pub fake: FakeAdbServer,
    pub services: HostServices,
    pub tracker: DeviceTracker,
}

impl TestRig {
    pub async fn with_device(serial: &str) -> (Self, DeviceHandle) {
        let fake = FakeAdbServer::spawn().await.expect("spawn fake adb server");
        let services = fake.host_services();
        let tracker = DeviceTracker::start(services.clone());
        fake.connect_device(serial);
        let device = tracker
            .wait_for_device(&DeviceSelector::serial(serial), Duration::from_secs(10))
            .await
            .expect("device did not come online");
        (
            Self {
                fake,
                services,
                tracker,
            },
            device,
        )
    }

    pub fn shutdown(&self) {
        self.tracker.shutdown();
        self.fake.shutdown();
    }
}

pub async fn proxy_socket_addr(process: &JdwpProcess) -> SocketAddr {
    let mut status = process.proxy_status();
    loop {
        if let Some(addr) = status.borrow_and_update().socket_address {
            return addr;
        }
        status.changed().await.expect("proxy status sender dropped");
    }
}

/// Connect an external debugger to the process's proxy endpoint.
pub async fn attach_debugger(process: &JdwpProcess) -> JdwpSession {
    let addr = proxy_socket_addr(process).await;
    let stream = TcpStream::connect(addr).await.expect("connect to proxy");
    JdwpSession::connect(stream, JdwpSessionConfig::default())
        .await
        .expect("JDWP handshake with proxy")
}

/// Read packets until the reply with `id` arrives.
pub async fn receive_reply(session: &JdwpSession, id: u32) -> JdwpPacket {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let packet = session.receive_packet().await.expect("receive packet");
            if packet.id == id {
                return packet;
            }
        }
    })
    .await
    .expect("no reply in time")
}
