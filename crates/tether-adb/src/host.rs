//! The ADB host request/response protocol.
//!
//! Wire format: a request is `<4 uppercase hex digits: length><service
//! string>`; the response header is the 4 ASCII bytes `OKAY` or `FAIL`. A
//! FAIL is followed by a length-prefixed UTF-8 error message. Length-prefixed
//! payloads elsewhere use the same `<4 hex digits><payload>` convention, with
//! the sole exception of the transport id, a fixed 8-byte little-endian
//! integer sent after OKAY when a `host:tport:` selector variant is used.

use std::net::SocketAddr;
use std::time::Duration;

use crate::channel::{AdbChannel, INFINITE_TIMEOUT};
use crate::selector::DeviceSelector;
use crate::{AdbError, Result};

pub type TransportId = u64;

const RESPONSE_HEADER_LEN: usize = 4;
const LENGTH_PREFIX_LEN: usize = 4;
const TRANSPORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct HostServicesConfig {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for HostServicesConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// Entry point for running services against the ADB server.
///
/// Cheap to clone; every query opens a fresh channel, as the protocol
/// requires.
#[derive(Clone)]
pub struct HostServices {
    server_addr: SocketAddr,
    config: HostServicesConfig,
}

impl HostServices {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self::with_config(server_addr, HostServicesConfig::default())
    }

    pub fn with_config(server_addr: SocketAddr, config: HostServicesConfig) -> Self {
        Self {
            server_addr,
            config,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    async fn open_channel(&self) -> Result<AdbChannel> {
        AdbChannel::connect(self.server_addr, self.config.connect_timeout).await
    }

    /// Open a fresh channel, send `service`, and consume the OKAY/FAIL
    /// response. On OKAY the channel is returned open, positioned for the
    /// service-specific continuation of the protocol.
    pub async fn start_host_query(&self, service: &str) -> Result<AdbChannel> {
        tracing::debug!(target: "tether.adb", service, "running host query");
        let mut channel = self.open_channel().await?;
        self.send_service_request(&mut channel, service).await?;
        self.consume_okay_fail(&mut channel, service).await?;
        Ok(channel)
    }

    pub async fn send_service_request(
        &self,
        channel: &mut AdbChannel,
        service: &str,
    ) -> Result<()> {
        let request = format!("{:04X}{}", service.len(), service);
        channel
            .write_exactly(request.as_bytes(), self.config.io_timeout)
            .await
    }

    async fn consume_okay_fail(&self, channel: &mut AdbChannel, service: &str) -> Result<()> {
        let mut header = [0u8; RESPONSE_HEADER_LEN];
        channel
            .read_exactly(&mut header, self.config.io_timeout)
            .await?;
        match &header {
            b"OKAY" => Ok(()),
            b"FAIL" => {
                let message = self.read_length_prefixed_data(channel).await?;
                let message = String::from_utf8_lossy(&message).into_owned();
                tracing::debug!(target: "tether.adb", service, message = %message, "host query failed");
                Err(AdbError::Failure(message))
            }
            other => Err(AdbError::Protocol(format!(
                "expected \"OKAY\" or \"FAIL\" response header, got {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Read a `<4 hex digits><payload>` block.
    pub async fn read_length_prefixed_data(&self, channel: &mut AdbChannel) -> Result<Vec<u8>> {
        self.read_frame(channel, self.config.io_timeout).await
    }

    /// Like [`read_length_prefixed_data`], but willing to wait indefinitely
    /// for the length prefix. Streaming services deliver frames at the
    /// daemon's leisure; only the payload, once announced, is held to the
    /// I/O deadline.
    ///
    /// [`read_length_prefixed_data`]: HostServices::read_length_prefixed_data
    async fn read_stream_frame(&self, channel: &mut AdbChannel) -> Result<Vec<u8>> {
        self.read_frame(channel, INFINITE_TIMEOUT).await
    }

    async fn read_frame(&self, channel: &mut AdbChannel, prefix_timeout: Duration) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        channel.read_exactly(&mut prefix, prefix_timeout).await?;
        let length = parse_length_prefix(&prefix)?;
        let mut payload = vec![0u8; length];
        channel
            .read_exactly(&mut payload, self.config.io_timeout)
            .await?;
        Ok(payload)
    }

    /// One-shot host query returning a single length-prefixed payload.
    pub async fn host_query_data(&self, service: &str) -> Result<Vec<u8>> {
        let mut channel = self.start_host_query(service).await?;
        self.read_length_prefixed_data(&mut channel).await
    }

    /// `host:devices`: a single snapshot of the daemon's device list.
    pub async fn devices(&self) -> Result<Vec<RawDeviceInfo>> {
        let data = self.host_query_data("host:devices").await?;
        parse_device_list(&data)
    }

    /// `host:track-devices`: a stream of device-list snapshots, one whenever
    /// the daemon's view changes.
    pub async fn track_devices(&self) -> Result<DeviceListStream> {
        let channel = self.start_host_query("host:track-devices").await?;
        Ok(DeviceListStream {
            services: self.clone(),
            channel,
        })
    }

    /// Issue the transport-selection service for `selector` on an open
    /// channel. Returns the daemon-assigned transport id when the selector
    /// variant reports one.
    pub async fn switch_to_transport(
        &self,
        channel: &mut AdbChannel,
        selector: &DeviceSelector,
    ) -> Result<Option<TransportId>> {
        let service = selector.transport_service();
        self.send_service_request(channel, &service).await?;
        self.consume_okay_fail(channel, &service).await?;
        if !selector.returns_transport_id() {
            return Ok(None);
        }
        let mut raw = [0u8; TRANSPORT_ID_LEN];
        channel.read_exactly(&mut raw, self.config.io_timeout).await?;
        Ok(Some(TransportId::from_le_bytes(raw)))
    }

    /// Open a channel, switch it to the selected device's transport, then
    /// start `service` on the device.
    pub async fn open_device_service(
        &self,
        selector: &DeviceSelector,
        service: &str,
    ) -> Result<(AdbChannel, Option<TransportId>)> {
        tracing::debug!(target: "tether.adb", %selector, service, "running device query");
        let mut channel = self.open_channel().await?;
        let transport_id = self.switch_to_transport(&mut channel, selector).await?;
        self.send_service_request(&mut channel, service).await?;
        self.consume_okay_fail(&mut channel, service).await?;
        Ok((channel, transport_id))
    }

    /// Drain a raw-output service (legacy `shell:` and friends) until the
    /// daemon closes the stream.
    pub async fn read_to_eof(&self, channel: &mut AdbChannel) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = channel.read_some(&mut buf, self.config.io_timeout).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Run a shell command on the device and capture its full output.
    pub async fn device_shell(&self, selector: &DeviceSelector, command: &str) -> Result<String> {
        let service = format!("shell:{command}");
        let (mut channel, _) = self.open_device_service(selector, &service).await?;
        let output = self.read_to_eof(&mut channel).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// `track-jdwp`: a stream of pid-list frames for the selected device.
    pub async fn track_jdwp(&self, selector: &DeviceSelector) -> Result<JdwpPidStream> {
        let (channel, _) = self.open_device_service(selector, "track-jdwp").await?;
        Ok(JdwpPidStream {
            services: self.clone(),
            channel,
        })
    }

    /// `jdwp:<pid>`: open the raw JDWP tunnel to one process. The returned
    /// channel carries JDWP (starting with its handshake) from here on.
    pub async fn open_jdwp(&self, selector: &DeviceSelector, pid: u32) -> Result<AdbChannel> {
        let service = format!("jdwp:{pid}");
        let (channel, _) = self.open_device_service(selector, &service).await?;
        Ok(channel)
    }
}

/// Live `host:track-devices` stream.
pub struct DeviceListStream {
    services: HostServices,
    channel: AdbChannel,
}

impl DeviceListStream {
    /// Wait for the next device-list snapshot. A clean daemon close surfaces
    /// [`AdbError::ConnectionClosed`].
    pub async fn next_snapshot(&mut self) -> Result<Vec<RawDeviceInfo>> {
        let frame = self.services.read_stream_frame(&mut self.channel).await?;
        parse_device_list(&frame)
    }
}

/// Live `track-jdwp` stream.
pub struct JdwpPidStream {
    services: HostServices,
    channel: AdbChannel,
}

impl JdwpPidStream {
    /// Wait for the next pid-list frame. A clean daemon close surfaces
    /// [`AdbError::ConnectionClosed`].
    pub async fn next_pids(&mut self) -> Result<Vec<u32>> {
        let frame = self.services.read_stream_frame(&mut self.channel).await?;
        parse_pid_list(&frame)
    }
}

/// One entry of a raw daemon device list, before provisioning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDeviceInfo {
    pub serial: String,
    pub state: RawDeviceState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawDeviceState {
    /// Reported as `device`: connected and authorized.
    Online,
    Unauthorized,
    Offline,
    Other(String),
}

impl RawDeviceState {
    fn parse(s: &str) -> Self {
        match s {
            "device" => Self::Online,
            "unauthorized" => Self::Unauthorized,
            "offline" => Self::Offline,
            other => Self::Other(other.to_string()),
        }
    }
}

fn parse_length_prefix(prefix: &[u8; LENGTH_PREFIX_LEN]) -> Result<usize> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| AdbError::Protocol(format!("invalid length prefix {prefix:?}")))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| AdbError::Protocol(format!("invalid length prefix {text:?}")))
}

fn parse_device_list(data: &[u8]) -> Result<Vec<RawDeviceInfo>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| AdbError::Protocol("device list is not valid UTF-8".to_string()))?;
    let mut devices = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (serial, state) = line.split_once('\t').ok_or_else(|| {
            AdbError::Protocol(format!("malformed device list line {line:?}"))
        })?;
        devices.push(RawDeviceInfo {
            serial: serial.to_string(),
            state: RawDeviceState::parse(state),
        });
    }
    Ok(devices)
}

fn parse_pid_list(data: &[u8]) -> Result<Vec<u32>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| AdbError::Protocol("pid list is not valid UTF-8".to_string()))?;
    let mut pids = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid = line
            .parse::<u32>()
            .map_err(|_| AdbError::Protocol(format!("malformed pid {line:?}")))?;
        pids.push(pid);
    }
    Ok(pids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_parses_hex() {
        assert_eq!(parse_length_prefix(b"0004").unwrap(), 4);
        assert_eq!(parse_length_prefix(b"00aF").unwrap(), 0xAF);
        assert!(matches!(
            parse_length_prefix(b"00zz"),
            Err(AdbError::Protocol(_))
        ));
    }

    #[test]
    fn device_list_parses_states() {
        let data = b"0123456789\tdevice\nemulator-5554\tunauthorized\nx\toffline\n";
        let devices = parse_device_list(data).unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "0123456789");
        assert_eq!(devices[0].state, RawDeviceState::Online);
        assert_eq!(devices[1].state, RawDeviceState::Unauthorized);
        assert_eq!(devices[2].state, RawDeviceState::Offline);
    }

    #[test]
    fn device_list_rejects_malformed_lines() {
        assert!(matches!(
            parse_device_list(b"no-tab-here\n"),
            Err(AdbError::Protocol(_))
        ));
    }

    #[test]
    fn pid_list_parses_decimal_pids() {
        assert_eq!(parse_pid_list(b"10\n11\n").unwrap(), vec![10, 11]);
        assert_eq!(parse_pid_list(b"").unwrap(), Vec::<u32>::new());
        assert!(matches!(
            parse_pid_list(b"10\nnot-a-pid\n"),
            Err(AdbError::Protocol(_))
        ));
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::*;
    use crate::fake::FakeAdbServer;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A one-connection server that ignores the request and writes a fixed
    /// byte response.
    async fn canned_response_server(response: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut scratch = [0u8; 256];
            let _ = stream.read(&mut scratch).await;
            let _ = stream.write_all(response).await;
        });
        addr
    }

    #[tokio::test]
    async fn devices_query_round_trips() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device("0123456789");
        let services = fake.host_services();

        let devices = services.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "0123456789");
        assert_eq!(devices[0].state, RawDeviceState::Online);
        fake.shutdown();
    }

    #[tokio::test]
    async fn fail_response_surfaces_daemon_message() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        let services = fake.host_services();

        let err = services
            .open_device_service(&DeviceSelector::serial("nope"), "track-jdwp")
            .await
            .unwrap_err();
        match err {
            AdbError::Failure(message) => assert!(message.contains("'nope' not found")),
            other => panic!("expected Failure, got {other:?}"),
        }
        fake.shutdown();
    }

    #[tokio::test]
    async fn unexpected_response_header_is_protocol_error() {
        let addr = canned_response_server(b"WHAT").await;
        let services = HostServices::new(addr);
        assert!(matches!(
            services.start_host_query("host:devices").await,
            Err(AdbError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn malformed_fail_length_prefix_is_protocol_error() {
        let addr = canned_response_server(b"FAILzz11").await;
        let services = HostServices::new(addr);
        assert!(matches!(
            services.start_host_query("host:devices").await,
            Err(AdbError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let guard = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let services = HostServices::with_config(
            addr,
            HostServicesConfig {
                connect_timeout: Duration::from_secs(5),
                io_timeout: Duration::from_millis(50),
            },
        );
        assert!(matches!(
            services.start_host_query("host:devices").await,
            Err(AdbError::Timeout)
        ));
        guard.abort();
    }

    #[tokio::test]
    async fn tport_transport_switch_reports_transport_id() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device("0123456789");
        let services = fake.host_services();

        let selector = DeviceSelector::serial("0123456789").with_transport_id_tracking();
        let (mut channel, transport_id) = services
            .open_device_service(&selector, "shell:getprop ro.serialno")
            .await
            .unwrap();
        assert!(transport_id.is_some());
        let output = services.read_to_eof(&mut channel).await.unwrap();
        assert_eq!(output, b"board-0123456789\n");
        fake.shutdown();
    }

    #[tokio::test]
    async fn legacy_transport_switch_reports_no_transport_id() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device("0123456789");
        let services = fake.host_services();

        let selector = DeviceSelector::serial("0123456789");
        let (_, transport_id) = services
            .open_device_service(&selector, "shell:getprop ro.serialno")
            .await
            .unwrap();
        assert_eq!(transport_id, None);
        fake.shutdown();
    }

    #[tokio::test]
    async fn device_shell_runs_getprop() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device_with_props("d1", &[("ro.product.model", "Pixel 9")]);
        let services = fake.host_services();

        let output = services
            .device_shell(&DeviceSelector::serial("d1"), "getprop ro.product.model")
            .await
            .unwrap();
        assert_eq!(output.trim(), "Pixel 9");
        fake.shutdown();
    }

    #[tokio::test]
    async fn track_devices_streams_snapshots() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        let services = fake.host_services();

        let mut stream = services.track_devices().await.unwrap();
        assert_eq!(stream.next_snapshot().await.unwrap(), Vec::new());

        fake.connect_device("d1");
        let snapshot = stream.next_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].serial, "d1");

        fake.disconnect_device("d1");
        assert_eq!(stream.next_snapshot().await.unwrap(), Vec::new());
        fake.shutdown();
    }

    #[tokio::test]
    async fn track_jdwp_streams_pid_lists() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device("d1");
        fake.start_client("d1", 10, "com.example.a");
        let services = fake.host_services();

        let mut stream = services
            .track_jdwp(&DeviceSelector::serial("d1"))
            .await
            .unwrap();
        assert_eq!(stream.next_pids().await.unwrap(), vec![10]);

        fake.start_client("d1", 11, "com.example.b");
        assert_eq!(stream.next_pids().await.unwrap(), vec![10, 11]);

        fake.stop_client("d1", 10);
        assert_eq!(stream.next_pids().await.unwrap(), vec![11]);
        fake.shutdown();
    }

    #[tokio::test]
    async fn track_jdwp_stream_closes_on_device_disconnect() {
        let fake = FakeAdbServer::spawn().await.unwrap();
        fake.connect_device("d1");
        let services = fake.host_services();

        let mut stream = services
            .track_jdwp(&DeviceSelector::serial("d1"))
            .await
            .unwrap();
        assert_eq!(stream.next_pids().await.unwrap(), Vec::<u32>::new());

        fake.disconnect_device("d1");
        assert!(matches!(
            stream.next_pids().await,
            Err(AdbError::ConnectionClosed)
        ));
        fake.shutdown();
    }
}
