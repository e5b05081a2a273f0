//! Resolution and reachability probing of the downstream SRT server.
//!
//! Every resolved address is probed with a minimal SRT handshake induction
//!  packet; the first one that echoes a handshake back wins. If none confirms,
//!  the receiver proceeds with the first resolved address anyway - the server
//!  may simply not be up yet.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::protocol::wire::{MTU, SRT_TYPE_HANDSHAKE};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_LEN: usize = 64;

/// A caller-induction handshake: 16-byte SRT control header followed by the
///  handshake information block (version 4, extension field 2, type 1).
fn induction_packet() -> BytesMut {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.put_u16(SRT_TYPE_HANDSHAKE);
    buf.put_u16(0); // subtype
    buf.put_u32(0); // type-specific info
    buf.put_u32(0); // timestamp
    buf.put_u32(0); // destination socket id
    buf.put_u32(4); // version
    buf.put_u16(2); // extension field
    buf.put_u16(0); // encryption field
    buf.put_u32(0); // initial sequence number
    buf.put_u32(0); // mtu
    buf.put_u32(0); // max flow window
    buf.put_u32(1); // handshake type: induction
    buf.put_u32(0); // srt socket id
    buf.put_u32(0); // syn cookie
    buf.put_slice(&[0u8; 16]); // peer ip
    buf
}

pub async fn resolve_srt_address(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve the address {}:{}", host, port))?
        .collect();
    if candidates.is_empty() {
        bail!("failed to resolve the address {}:{}", host, port);
    }

    for addr in &candidates {
        info!("trying to connect to SRT at {}...", addr);
        match probe(*addr).await {
            Ok(()) => {
                info!("confirmed SRT server at {}", addr);
                return Ok(*addr);
            }
            Err(e) => info!("probe of {} failed: {:#}", addr, e),
        }
    }

    let fallback = candidates[0];
    warn!(
        "failed to confirm that an SRT server is reachable at any address, proceeding with {}",
        fallback
    );
    Ok(fallback)
}

async fn probe(addr: SocketAddr) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;

    let handshake = induction_packet();
    let sent = socket.send(&handshake).await?;
    if sent != handshake.len() {
        bail!("short handshake send");
    }

    let mut buf = [0u8; MTU];
    let received = tokio::time::timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
        .await
        .context("no handshake response")??;
    if received != HANDSHAKE_LEN {
        bail!("unexpected handshake response length {}", received);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_confirms_responding_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; MTU];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HANDSHAKE_LEN);
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let addr = resolve_srt_address("127.0.0.1", port).await.unwrap();
        assert_eq!(addr, format!("127.0.0.1:{}", port).parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_first_address() {
        // nothing is listening; resolution still yields the first candidate
        let addr = resolve_srt_address("127.0.0.1", 1).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_fails_for_unknown_host() {
        assert!(resolve_srt_address("host.invalid.", 4001).await.is_err());
    }
}
