//! The receiver event loop.
//!
//! One task serializes every state mutation: datagrams from the bond socket,
//!  server traffic relayed in by the per-group reader tasks, and the periodic
//!  housekeeping tick all funnel through the same `select!` loop. Nothing else
//!  ever touches the registry.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, trace};

use crate::clock::Clock;
use crate::config::ReceiverConfig;
use crate::connection::Registry;
use crate::protocol::srt::SrtEvent;
use crate::protocol::srtla::{self, BondHandler};
use crate::protocol::wire::{self, MTU};
use crate::quality::{balancer, evaluator};

/// Bond datagrams drained per wakeup before yielding back to the multiplexer.
const RECV_BATCH_SIZE: usize = 64;
/// Capacity of the group-socket event channel.
const SRT_EVENT_QUEUE: usize = 1024;

pub struct Receiver {
    config: ReceiverConfig,
    bond_socket: Arc<UdpSocket>,
    registry: Registry,
    clock: Clock,
    srt_events_tx: mpsc::Sender<SrtEvent>,
    srt_events_rx: mpsc::Receiver<SrtEvent>,
}

impl Receiver {
    /// Bind the dual-stack bond socket and set up the loop's plumbing.
    pub fn bind(config: ReceiverConfig) -> anyhow::Result<Receiver> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
            .context("bond socket creation failed")?;
        socket
            .set_only_v6(false)
            .context("failed to clear IPV6_V6ONLY")?;
        socket
            .set_recv_buffer_size(config.recv_buf_size)
            .context("failed to set receive buffer size")?;
        socket
            .set_send_buffer_size(config.send_buf_size)
            .context("failed to set send buffer size")?;
        socket
            .set_nonblocking(true)
            .context("failed to set the bond socket non-blocking")?;

        let listen_addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.srtla_port));
        socket
            .bind(&listen_addr.into())
            .context("bond socket bind failed")?;

        let bond_socket = Arc::new(UdpSocket::from_std(socket.into())?);
        let (srt_events_tx, srt_events_rx) = mpsc::channel(SRT_EVENT_QUEUE);

        Ok(Receiver {
            config,
            bond_socket,
            registry: Registry::new(),
            clock: Clock::new(),
            srt_events_tx,
            srt_events_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.bond_socket.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Receiver {
            config,
            bond_socket,
            mut registry,
            clock,
            srt_events_tx,
            mut srt_events_rx,
        } = self;

        let mut tick = tokio::time::interval(config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MTU];

        info!(port = config.srtla_port, srt = %config.srt_addr, "receiver is now running");

        loop {
            select! {
                received = bond_socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let mut handler = BondHandler {
                                socket: &bond_socket,
                                registry: &mut registry,
                                config: &config,
                                clock: &clock,
                                srt_events: &srt_events_tx,
                            };
                            handler.process_packet(&buf[..len], peer).await;

                            // drain what else piled up, bounded per wakeup
                            for _ in 1..RECV_BATCH_SIZE {
                                match bond_socket.try_recv_from(&mut buf) {
                                    Ok((len, peer)) => handler.process_packet(&buf[..len], peer).await,
                                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                                    Err(e) => {
                                        error!("failed to read an srtla packet: {}", e);
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => error!("failed to read an srtla packet: {}", e),
                    }
                }

                event = srt_events_rx.recv() => {
                    let event = event.expect("the loop keeps a sender alive - this should never happen");
                    handle_srt_event(event, &bond_socket, &mut registry);
                }

                _ = tick.tick() => {
                    let now = clock.now();
                    registry.cleanup(now, &config, |conn| {
                        srtla::send_keepalive(&bond_socket, conn);
                    });
                    for group in registry.groups_mut() {
                        evaluator::evaluate_group(group, now, clock.now_ms(), &config, false);
                        balancer::adjust_weights(group, now, &config);
                    }
                }
            }
        }
    }
}

/// Dispatch one datagram (or failure) reported by a group-socket reader.
///
/// Server ACKs fan out to every member; everything else goes to whichever
///  member sent the last data packet. Events whose group has already been
///  removed resolve to nothing and are dropped.
fn handle_srt_event(event: SrtEvent, bond_socket: &UdpSocket, registry: &mut Registry) {
    match event {
        SrtEvent::Datagram { group_id, payload } => {
            let Some(group) = registry.group_by_id(group_id) else {
                trace!(group = %group_id.short(), "dropping event for removed group");
                return;
            };

            if wire::is_srt_ack(&payload) {
                for conn in &group.conns {
                    if !try_send_to(bond_socket, &payload, conn.peer()) {
                        error!(peer = %conn.peer(), group = %group_id.short(), "failed to send the SRT ACK");
                    }
                }
            } else if let Some(peer) = group.last_peer {
                if !try_send_to(bond_socket, &payload, peer) {
                    error!(%peer, group = %group_id.short(), "failed to send the SRT packet");
                }
            }
        }
        SrtEvent::Fatal { group_id } => {
            if registry.remove_group(group_id).is_some() {
                error!(group = %group_id.short(), "SRT socket failed, terminating the group");
            }
        }
    }
}

fn try_send_to(socket: &UdpSocket, payload: &[u8], to: SocketAddr) -> bool {
    matches!(socket.try_send_to(payload, to), Ok(sent) if sent == payload.len())
}
