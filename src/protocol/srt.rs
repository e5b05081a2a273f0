//! Downstream (SRT server) side of the relay.
//!
//! Each group talks to the server through its own connected UDP socket. The
//!  socket is opened lazily on the first forwarded data packet. A small reader
//!  task per socket pushes inbound server traffic into the receiver loop's
//!  event channel; it never touches shared state, so all bookkeeping stays on
//!  the loop. Events carry the stable group id and are re-resolved on receipt,
//!  which makes events for an already-removed group harmless.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

use crate::config::ReceiverConfig;
use crate::connection::{Group, GroupId};
use crate::protocol::wire::{MTU, SRT_MIN_LEN};

/// What a group-socket reader task reports back to the receiver loop.
#[derive(Debug)]
pub enum SrtEvent {
    /// A well-formed datagram from the server, to be fanned back out.
    Datagram { group_id: GroupId, payload: BytesMut },
    /// The socket failed (read error, short read, oversized datagram); the
    ///  owning group must be torn down.
    Fatal { group_id: GroupId },
}

/// Forward one uplink datagram to the SRT server, opening the group socket on
///  first use. Any failure here is fatal for the group; the caller removes it
///  from the registry.
pub fn forward_to_srt_server(
    group: &mut Group,
    payload: &[u8],
    config: &ReceiverConfig,
    events: &mpsc::Sender<SrtEvent>,
) -> anyhow::Result<()> {
    if group.srt_socket().is_none() {
        open_group_socket(group, config, events)?;
    }

    let socket = group.srt_socket().ok_or_else(|| anyhow!("no group socket"))?;
    let sent = socket
        .try_send(payload)
        .context("failed to forward packet to the SRT server")?;
    if sent != payload.len() {
        return Err(anyhow!(
            "short send to the SRT server: {} of {} bytes",
            sent,
            payload.len()
        ));
    }
    trace!(group = %group.id().short(), len = payload.len(), "forwarded packet to the SRT server");
    Ok(())
}

fn open_group_socket(
    group: &mut Group,
    config: &ReceiverConfig,
    events: &mpsc::Sender<SrtEvent>,
) -> anyhow::Result<()> {
    let domain = match config.srt_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create an SRT socket")?;
    socket
        .set_recv_buffer_size(config.recv_buf_size)
        .context("failed to set receive buffer size")?;
    socket
        .set_send_buffer_size(config.send_buf_size)
        .context("failed to set send buffer size")?;
    socket
        .set_nonblocking(true)
        .context("failed to set the SRT socket non-blocking")?;
    socket
        .connect(&config.srt_addr.into())
        .context("failed to connect to the SRT server")?;

    let socket = UdpSocket::from_std(socket.into())?;
    let local_port = socket.local_addr()?.port();
    let socket = Arc::new(socket);
    let reader = spawn_reader(group.id(), socket.clone(), events.clone());

    info!(group = %group.id().short(), local_port, "created SRT socket");
    group.attach_srt_socket(socket, local_port, reader, &config.socket_info_prefix);
    Ok(())
}

/// Drain one group socket into the receiver loop's event channel.
fn spawn_reader(
    group_id: GroupId,
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<SrtEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // one byte of headroom so an over-MTU datagram is detectable
        let mut buf = vec![0u8; MTU + 1];
        loop {
            match socket.recv(&mut buf).await {
                Ok(len) if (SRT_MIN_LEN..=MTU).contains(&len) => {
                    let payload = BytesMut::from(&buf[..len]);
                    if events.send(SrtEvent::Datagram { group_id, payload }).await.is_err() {
                        return;
                    }
                }
                Ok(len) => {
                    error!(group = %group_id.short(), len, "unusable datagram from the SRT server");
                    let _ = events.send(SrtEvent::Fatal { group_id }).await;
                    return;
                }
                Err(e) => {
                    error!(group = %group_id.short(), "failed to read the SRT socket: {}", e);
                    let _ = events.send(SrtEvent::Fatal { group_id }).await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;
    use super::*;

    fn test_config(srt_addr: SocketAddr) -> ReceiverConfig {
        let mut config = ReceiverConfig::new(0, srt_addr);
        config.socket_info_prefix =
            format!("{}/srtla-srt-test-", std::env::temp_dir().display());
        config
    }

    #[tokio::test]
    async fn test_forward_opens_socket_and_delivers() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(server.local_addr().unwrap());
        let (tx, _rx) = mpsc::channel(16);

        let mut group = Group::new(&[1u8; 16], Instant::now());
        assert!(group.srt_socket().is_none());

        forward_to_srt_server(&mut group, b"0123456789abcdef", &config, &tx).unwrap();
        assert!(group.srt_socket().is_some());

        let mut buf = [0u8; 64];
        let (len, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_reader_forwards_server_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(server.local_addr().unwrap());
        let (tx, mut rx) = mpsc::channel(16);

        let mut group = Group::new(&[2u8; 16], Instant::now());
        forward_to_srt_server(&mut group, b"0123456789abcdef", &config, &tx).unwrap();
        let mut buf = [0u8; 64];
        let (_, group_addr) = server.recv_from(&mut buf).await.unwrap();

        server.send_to(b"response-from-server", group_addr).await.unwrap();
        match rx.recv().await.unwrap() {
            SrtEvent::Datagram { group_id, payload } => {
                assert_eq!(group_id, group.id());
                assert_eq!(&payload[..], b"response-from-server");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_server_datagram_is_fatal() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(server.local_addr().unwrap());
        let (tx, mut rx) = mpsc::channel(16);

        let mut group = Group::new(&[3u8; 16], Instant::now());
        forward_to_srt_server(&mut group, b"0123456789abcdef", &config, &tx).unwrap();
        let mut buf = [0u8; 64];
        let (_, group_addr) = server.recv_from(&mut buf).await.unwrap();

        server.send_to(b"tiny", group_addr).await.unwrap();
        match rx.recv().await.unwrap() {
            SrtEvent::Fatal { group_id } => assert_eq!(group_id, group.id()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
