//! Bond (uplink) side of the relay.
//!
//! Classifies every datagram arriving on the bond socket, runs the three-step
//!  registration handshake, echoes keepalives (harvesting sender telemetry
//!  from extended ones), and pushes data packets through NAK deduplication,
//!  sequence accounting, and the throttled ACK engine before forwarding them
//!  to the downstream server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::clock::Clock;
use crate::config::ReceiverConfig;
use crate::connection::registry::AddressMatch;
use crate::connection::{Connection, Group, GroupId, Registry};
use crate::protocol::srt::{self, SrtEvent};
use crate::protocol::wire::{
    self, SRTLA_TYPE_KEEPALIVE, SRTLA_TYPE_REG3, SRTLA_TYPE_REG_ERR, SRTLA_TYPE_REG_NGP,
    SRT_MIN_LEN,
};
use crate::quality::evaluator;

/// How long a REG2 may wait for its REG1 to materialize under reordering.
const REG2_WAIT: Duration = Duration::from_millis(200);
const REG2_WAIT_POLL: Duration = Duration::from_millis(10);

/// NAKs within one evaluation window before an out-of-schedule quality
///  evaluation is forced.
const NACK_EVAL_TRIGGER: u32 = 5;

/// Per-iteration state for handling bond-socket traffic. Built fresh for each
///  datagram batch by the receiver loop; owns nothing.
pub struct BondHandler<'a> {
    pub socket: &'a UdpSocket,
    pub registry: &'a mut Registry,
    pub config: &'a ReceiverConfig,
    pub clock: &'a Clock,
    pub srt_events: &'a mpsc::Sender<SrtEvent>,
}

impl BondHandler<'_> {
    /// Classify and process one datagram from an uplink.
    pub async fn process_packet(&mut self, buf: &[u8], peer: SocketAddr) {
        let now = self.clock.now();

        if wire::is_reg1(buf) {
            self.register_group(buf, peer, now);
            return;
        }
        if wire::is_reg2(buf) {
            self.register_connection(buf, peer, now).await;
            return;
        }

        // everything else requires a registered connection
        let AddressMatch::Member { group: group_idx, conn: conn_idx } =
            self.registry.find_by_address(&peer)
        else {
            return;
        };

        let group = self.registry.group_mut(group_idx);
        if group.conns[conn_idx].note_received(now, self.config.conn_timeout) {
            info!(%peer, group = %group.id().short(), "connection is recovering");
        }

        if wire::is_keepalive(buf) {
            handle_keepalive(self.socket, group, conn_idx, buf, peer, now);
            return;
        }
        if buf.len() < SRT_MIN_LEN {
            return;
        }

        self.handle_data(group_idx, conn_idx, buf, peer, now);
    }

    /// REG1: mint a new group and reply with the full 32-byte id.
    fn register_group(&mut self, buf: &[u8], peer: SocketAddr, now: Instant) {
        if self.registry.len() >= self.config.max_groups {
            send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG_ERR), peer, "REG_ERR");
            error!(%peer, "group registration failed: max groups reached");
            return;
        }
        if self.registry.find_by_address(&peer) != AddressMatch::Unknown {
            send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG_ERR), peer, "REG_ERR");
            error!(%peer, "group registration failed: remote address already registered");
            return;
        }

        let mut group = Group::new(&buf[2..], now);
        group.last_peer = Some(peer);

        let reply = wire::encode_reg2(group.id().as_bytes());
        if !send_on(self.socket, &reply, peer, "REG2") {
            error!(%peer, "group registration failed: send error");
            return;
        }

        info!(%peer, group = %group.id().short(), "group registered");
        self.registry.add_group(group);
    }

    /// REG2: attach a connection to an existing group and reply REG3.
    async fn register_connection(&mut self, buf: &[u8], peer: SocketAddr, now: Instant) {
        let id = &buf[2..];

        let Some(group_id) = self.wait_group_by_id(id).await else {
            send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG_NGP), peer, "REG_NGP");
            error!(%peer, "connection registration failed: no group found");
            return;
        };

        let existing = self.registry.find_by_address(&peer);
        let same_group = |idx: usize| self.registry.groups()[idx].id() == group_id;
        let conn_exists = match existing {
            AddressMatch::Member { group, conn } if same_group(group) => Some(conn),
            AddressMatch::LastPeer { group } if same_group(group) => None,
            AddressMatch::Unknown => None,
            AddressMatch::Member { group, .. } | AddressMatch::LastPeer { group } => {
                send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG_ERR), peer, "REG_ERR");
                error!(
                    %peer,
                    group = %self.registry.groups()[group].id().short(),
                    "connection registration failed: provided group id mismatch"
                );
                return;
            }
        };

        let group = self
            .registry
            .group_by_id(group_id)
            .expect("group was resolved above and nothing ran in between - this should never happen");

        if conn_exists.is_none() && group.conns.len() >= self.config.max_conns_per_group {
            send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG_ERR), peer, "REG_ERR");
            error!(%peer, group = %group_id.short(), "connection registration failed: max group conns reached");
            return;
        }

        if !send_on(self.socket, &wire::encode_bare(SRTLA_TYPE_REG3), peer, "REG3") {
            error!(%peer, group = %group_id.short(), "connection registration failed: socket send error");
            return;
        }

        if conn_exists.is_none() {
            group.conns.push(Connection::new(peer, now));
        }
        group.write_socket_info_file();
        group.last_peer = Some(peer);
        info!(%peer, group = %group_id.short(), "connection registered");
    }

    /// Bounded wait for the group id to appear, tolerating REG1/REG2
    ///  reordering under bursty delivery. A cooperative poll: REG2 traffic is
    ///  rare enough that briefly stalling the loop is acceptable.
    async fn wait_group_by_id(&mut self, id: &[u8]) -> Option<GroupId> {
        let deadline = Instant::now() + REG2_WAIT;
        loop {
            if let Some(group) = self.registry.find_by_id(id) {
                return Some(group.id());
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(REG2_WAIT_POLL).await;
        }
    }

    /// The data path: counters, NAK dedup, sequence/ACK accounting, forward.
    fn handle_data(
        &mut self,
        group_idx: usize,
        conn_idx: usize,
        buf: &[u8],
        peer: SocketAddr,
        now: Instant,
    ) {
        let now_ms = self.clock.now_ms();
        let group = self.registry.group_mut(group_idx);
        group.last_peer = Some(peer);
        group.conns[conn_idx].stats.record_packet(buf.len());

        if wire::is_srt_nak(buf) {
            let hash = crate::util::nak_dedup::hash_nak_payload(buf);
            if !crate::util::nak_dedup::should_accept_nak(&mut group.nak_cache, hash, now_ms) {
                info!(%peer, group = %group.id().short(), "duplicate NAK packet suppressed");
                return;
            }

            group.conns[conn_idx].stats.record_nak();
            info!(
                %peer,
                group = %group.id().short(),
                "received NAK packet, total loss: {}",
                group.conns[conn_idx].stats.packets_lost
            );

            let eval_due = group
                .last_quality_eval
                .map_or(true, |at| now.saturating_duration_since(at) > Duration::from_secs(1));
            if group.conns[conn_idx].stats.nack_count > NACK_EVAL_TRIGGER && eval_due {
                evaluator::evaluate_group(group, now, now_ms, self.config, true);
            }
        }

        if let Some(sn) = wire::srt_sequence_number(buf) {
            if let Some(batch) = group.conns[conn_idx].register_sequence(sn) {
                emit_ack(self.socket, group.id(), &mut group.conns[conn_idx], &batch, now_ms, self.config);
            }
        }

        if let Err(e) = srt::forward_to_srt_server(group, buf, self.config, self.srt_events) {
            let group_id = group.id();
            error!(group = %group_id.short(), "failed to forward packet, terminating the group: {:#}", e);
            self.registry.remove_group(group_id);
        }
    }
}

/// Echo a keepalive back verbatim; extended keepalives additionally refresh
///  the connection's telemetry block and latch the capability flag.
fn handle_keepalive(
    socket: &UdpSocket,
    group: &mut Group,
    conn_idx: usize,
    buf: &[u8],
    peer: SocketAddr,
    now: Instant,
) {
    if let Some(telemetry) = wire::parse_keepalive_telemetry(buf) {
        let conn = &mut group.conns[conn_idx];
        conn.stats.apply_telemetry(&telemetry, now);
        info!(
            %peer,
            group = %group.id().short(),
            "per-connection keepalive: id {}, bw {:.2} kbit/s, window {}, in flight {}, rtt {} ms, naks {}",
            telemetry.conn_id,
            f64::from(telemetry.bitrate_bytes_per_sec) * 8.0 / 1000.0,
            telemetry.window,
            telemetry.in_flight,
            telemetry.rtt_ms,
            telemetry.nak_count,
        );
    } else {
        debug!(
            %peer,
            group = %group.id().short(),
            "keepalive without sender telemetry, quality evaluation will use receiver-only metrics"
        );
    }

    send_on(socket, buf, peer, "keepalive echo");
}

/// Emit the full ACK batch unless the connection's throttle gate holds it
///  back. The batch is consumed either way; a held ACK is simply dropped.
fn emit_ack(
    socket: &UdpSocket,
    group_id: GroupId,
    conn: &mut Connection,
    batch: &[u32; crate::config::RECV_ACK_INT],
    now_ms: u64,
    config: &ReceiverConfig,
) {
    let throttle = conn.stats.ack_throttle_factor;
    if throttle > 0.0 && throttle < 1.0 {
        let min_interval_ms = (config.ack_throttle_interval.as_millis() as f64 / throttle) as u64;
        if conn.stats.last_ack_sent_ms > 0 && now_ms < conn.stats.last_ack_sent_ms + min_interval_ms {
            trace!(
                peer = %conn.peer(),
                group = %group_id.short(),
                "ACK throttled, next in {} ms (factor {:.2})",
                conn.stats.last_ack_sent_ms + min_interval_ms - now_ms,
                throttle,
            );
            return;
        }
    }

    let ack = wire::encode_ack(batch);
    if send_on(socket, &ack, conn.peer(), "ACK") {
        conn.stats.last_ack_sent_ms = now_ms;
        trace!(peer = %conn.peer(), group = %group_id.short(), "sent ACK (throttle factor {:.2})", throttle);
    }
}

/// Cleanup-driven keepalive towards a member that has gone quiet.
pub fn send_keepalive(socket: &UdpSocket, conn: &Connection) {
    if send_on(socket, &wire::encode_bare(SRTLA_TYPE_KEEPALIVE), conn.peer(), "keepalive") {
        debug!(peer = %conn.peer(), "sent keepalive packet");
    }
}

/// Non-blocking send on the bond socket. Anything but a full send counts as
///  failure and is logged; the caller decides whether that matters.
fn send_on(socket: &UdpSocket, payload: &[u8], to: SocketAddr, what: &str) -> bool {
    match socket.try_send_to(payload, to) {
        Ok(sent) if sent == payload.len() => true,
        Ok(sent) => {
            error!(%to, "short {} send: {} of {} bytes", what, sent, payload.len());
            false
        }
        Err(e) => {
            error!(%to, "failed to send {}: {}", what, e);
            false
        }
    }
}
