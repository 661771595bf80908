//! A live JDWP session over one TCP stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::packet::{perform_handshake, JdwpPacket, MAX_PACKET_LEN};
use crate::Result;

#[derive(Debug, Clone)]
pub struct JdwpSessionConfig {
    pub handshake_timeout: Duration,
    pub max_packet_len: usize,
    /// First value handed out by [`JdwpSession::next_packet_id`]. Sessions
    /// owned by the proxy use a high base so their ids stay disjoint from an
    /// external debugger's (which count up from small integers).
    pub first_packet_id: u32,
}

impl Default for JdwpSessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            max_packet_len: MAX_PACKET_LEN,
            first_packet_id: 1,
        }
    }
}

/// One endpoint of a JDWP connection.
///
/// Reads and writes are independently serialized, so a session can be shared
/// (`Arc`) between one receive loop and any number of senders. Packet ids are
/// allocated monotonically from the configured base.
pub struct JdwpSession {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    next_id: AtomicU32,
    max_packet_len: usize,
}

impl JdwpSession {
    /// Perform the client-side handshake on `stream` and wrap it.
    pub async fn connect(mut stream: TcpStream, config: JdwpSessionConfig) -> Result<Self> {
        let _ = stream.set_nodelay(true);
        perform_handshake(&mut stream, config.handshake_timeout).await?;
        Ok(Self::from_handshaken_stream(stream, config))
    }

    /// Wrap a stream whose handshake has already been consumed (e.g. the
    /// debugger-facing side of the session proxy).
    pub fn from_handshaken_stream(stream: TcpStream, config: JdwpSessionConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            next_id: AtomicU32::new(config.first_packet_id),
            max_packet_len: config.max_packet_len,
        }
    }

    pub fn next_packet_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send_packet(&self, packet: &JdwpPacket) -> Result<()> {
        tracing::trace!(
            target: "tether.jdwp",
            id = packet.id,
            len = packet.length(),
            reply = packet.is_reply(),
            "sending packet"
        );
        let mut writer = self.writer.lock().await;
        packet.write_to(&mut *writer).await
    }

    pub async fn receive_packet(&self) -> Result<JdwpPacket> {
        let mut reader = self.reader.lock().await;
        let packet = JdwpPacket::read_from(&mut *reader, self.max_packet_len).await?;
        tracing::trace!(
            target: "tether.jdwp",
            id = packet.id,
            len = packet.length(),
            reply = packet.is_reply(),
            "received packet"
        );
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{accept_handshake, FLAG_REPLY};
    use crate::JdwpError;

    use tokio::net::TcpListener;

    /// Minimal echo VM: handshake, then answer every command with an empty
    /// reply carrying the same id.
    async fn spawn_echo_vm() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_handshake(&mut stream, Duration::from_secs(5))
                .await
                .unwrap();
            let (mut reader, mut writer) = stream.split();
            while let Ok(packet) = JdwpPacket::read_from(&mut reader, MAX_PACKET_LEN).await {
                if !packet.is_reply() {
                    let reply = JdwpPacket::reply(packet.id, 0, Vec::new());
                    if reply.write_to(&mut writer).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn session_sends_and_receives() {
        let addr = spawn_echo_vm().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let session = JdwpSession::connect(stream, JdwpSessionConfig::default())
            .await
            .unwrap();

        let id = session.next_packet_id();
        session
            .send_packet(&JdwpPacket::command(id, 1, 1, Vec::new()))
            .await
            .unwrap();
        let reply = session.receive_packet().await.unwrap();
        assert_eq!(reply.id, id);
        assert!(reply.is_reply());
        assert_eq!(reply.flags & FLAG_REPLY, FLAG_REPLY);
    }

    #[tokio::test]
    async fn packet_ids_are_monotonic_from_base() {
        let addr = spawn_echo_vm().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let session = JdwpSession::connect(
            stream,
            JdwpSessionConfig {
                first_packet_id: 0x4000_0000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(session.next_packet_id(), 0x4000_0000);
        assert_eq!(session.next_packet_id(), 0x4000_0001);
        assert_eq!(session.next_packet_id(), 0x4000_0002);
    }

    #[tokio::test]
    async fn closed_peer_surfaces_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            accept_handshake(&mut stream, Duration::from_secs(5))
                .await
                .unwrap();
            // Drop the connection right after the handshake.
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let session = JdwpSession::connect(stream, JdwpSessionConfig::default())
            .await
            .unwrap();
        assert!(matches!(
            session.receive_packet().await,
            Err(JdwpError::ConnectionClosed)
        ));
    }
}
