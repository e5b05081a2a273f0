use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{RECV_ACK_INT, RTT_HISTORY_SIZE, WEIGHT_FULL};
use crate::protocol::wire::SenderTelemetry;

/// Liveness of one uplink, as tracked across cleanup passes.
///
/// A connection that resurfaces after a timeout is not trusted immediately: it
///  goes through a probationary window first, and only counts as recovered if
///  traffic keeps arriving throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Live,
    Probationary { since: Instant },
    TimedOut,
}

/// What a cleanup pass concluded about a probationary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Completed,
    Failed,
}

/// Fixed-size ring of recent sender round-trip times, milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttHistory {
    samples: [u32; RTT_HISTORY_SIZE],
    next: usize,
}

impl RttHistory {
    pub fn push(&mut self, rtt_ms: u32) {
        self.samples[self.next] = rtt_ms;
        self.next = (self.next + 1) % RTT_HISTORY_SIZE;
    }

    /// Population standard deviation of the non-zero samples. Fewer than two
    ///  samples yield 0 - a single measurement has no jitter to speak of.
    pub fn jitter_ms(&self) -> f64 {
        let valid: Vec<f64> = self
            .samples
            .iter()
            .filter(|rtt| **rtt > 0)
            .map(|rtt| f64::from(*rtt))
            .collect();
        if valid.len() < 2 {
            return 0.0;
        }

        let mean = valid.iter().sum::<f64>() / valid.len() as f64;
        let variance = valid.iter().map(|rtt| (rtt - mean).powi(2)).sum::<f64>() / valid.len() as f64;
        variance.sqrt()
    }
}

/// Telemetry block populated from extended keepalives. All fields are
///  meaningless until `last_update` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryState {
    pub rtt_ms: u32,
    pub rtt_history: RttHistory,
    pub last_update: Option<Instant>,
    pub window: i32,
    pub in_flight: i32,
    pub sender_nak_count: u32,
    /// Snapshot of `sender_nak_count` at the previous evaluation, so the
    ///  evaluator can score the per-period NAK rate.
    pub last_sender_nak_count: u32,
    pub sender_bitrate_bps: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: u64,

    // Snapshots from the previous evaluation pass, for delta computation.
    pub last_bytes_received: u64,
    pub last_packets_received: u64,
    pub last_packets_lost: u64,
    /// Milliseconds-since-epoch of the previous evaluation; 0 = never.
    pub last_eval_time_ms: u64,

    pub error_points: u32,
    pub weight_percent: u8,
    /// Milliseconds-since-epoch of the last ACK that went out; 0 = never.
    pub last_ack_sent_ms: u64,
    pub ack_throttle_factor: f64,
    /// NAKs seen since the last evaluation; used to trigger an out-of-schedule
    ///  evaluation, zeroed by every pass.
    pub nack_count: u32,

    pub telemetry: TelemetryState,
    /// Latched to true by the first extended keepalive and never cleared, so
    ///  a capable sender is recognized even while it is busy transmitting and
    ///  not sending keepalives.
    supports_extended_keepalives: bool,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        ConnectionStats {
            bytes_received: 0,
            packets_received: 0,
            packets_lost: 0,
            last_bytes_received: 0,
            last_packets_received: 0,
            last_packets_lost: 0,
            last_eval_time_ms: 0,
            error_points: 0,
            weight_percent: WEIGHT_FULL,
            last_ack_sent_ms: 0,
            ack_throttle_factor: 1.0,
            nack_count: 0,
            telemetry: TelemetryState::default(),
            supports_extended_keepalives: false,
        }
    }
}

impl ConnectionStats {
    pub fn record_packet(&mut self, len: usize) {
        self.bytes_received += len as u64;
        self.packets_received += 1;
    }

    pub fn record_nak(&mut self) {
        self.packets_lost += 1;
        self.nack_count += 1;
    }

    pub fn apply_telemetry(&mut self, telemetry: &SenderTelemetry, now: Instant) {
        let t = &mut self.telemetry;
        t.rtt_history.push(telemetry.rtt_ms);
        t.rtt_ms = telemetry.rtt_ms;
        t.window = telemetry.window;
        t.in_flight = telemetry.in_flight;
        t.sender_nak_count = telemetry.nak_count;
        t.sender_bitrate_bps = telemetry.bitrate_bytes_per_sec;
        t.last_update = Some(now);
        self.supports_extended_keepalives = true;
    }

    /// Whether there is recent, meaningful sender telemetry to evaluate
    ///  against. When false the evaluator falls back to receiver-only metrics.
    pub fn has_valid_sender_telemetry(&self, now: Instant, staleness: Duration) -> bool {
        match self.telemetry.last_update {
            None => false,
            Some(at) => {
                now.saturating_duration_since(at) <= staleness
                    && (self.telemetry.rtt_ms > 0 || self.telemetry.window > 0)
            }
        }
    }

    pub fn supports_extended_keepalives(&self) -> bool {
        self.supports_extended_keepalives
    }

    /// Write back the per-period snapshots once all computations for an
    ///  evaluation are done.
    pub fn finish_eval_period(&mut self, now_ms: u64) {
        self.last_bytes_received = self.bytes_received;
        self.last_packets_received = self.packets_received;
        self.last_packets_lost = self.packets_lost;
        self.last_eval_time_ms = now_ms;
    }
}

/// One uplink from the sender to this receiver.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    last_received: Instant,
    connection_start: Instant,
    link_state: LinkState,

    recv_log: [u32; RECV_ACK_INT],
    recv_idx: usize,

    pub stats: ConnectionStats,
}

impl Connection {
    pub fn new(peer: SocketAddr, now: Instant) -> Connection {
        Connection {
            peer,
            last_received: now,
            connection_start: now,
            link_state: LinkState::Live,
            recv_log: [0; RECV_ACK_INT],
            recv_idx: 0,
            stats: ConnectionStats::default(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn connection_start(&self) -> Instant {
        self.connection_start
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn timed_out(&self, now: Instant, conn_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received) > conn_timeout
    }

    /// Register an inbound datagram. Returns true if this datagram brought the
    ///  connection back from a timeout, i.e. it just entered probation.
    pub fn note_received(&mut self, now: Instant, conn_timeout: Duration) -> bool {
        let was_timed_out =
            self.link_state == LinkState::TimedOut || self.timed_out(now, conn_timeout);
        self.last_received = now;

        if was_timed_out && !matches!(self.link_state, LinkState::Probationary { .. }) {
            self.link_state = LinkState::Probationary { since: now };
            return true;
        }
        false
    }

    /// Advance the recovery state machine; called from the cleanup pass.
    pub fn tick_recovery(
        &mut self,
        now: Instant,
        recovery_chance_period: Duration,
    ) -> Option<RecoveryOutcome> {
        let LinkState::Probationary { since } = self.link_state else {
            return None;
        };

        if self.last_received > since {
            if now.saturating_duration_since(since) > recovery_chance_period {
                self.link_state = LinkState::Live;
                return Some(RecoveryOutcome::Completed);
            }
        } else if now.saturating_duration_since(since) > recovery_chance_period {
            self.link_state = LinkState::TimedOut;
            return Some(RecoveryOutcome::Failed);
        }
        None
    }

    /// Append a sequence number to the receive log. Every tenth append drains
    ///  the log and returns the full batch for ACK emission.
    pub fn register_sequence(&mut self, sn: u32) -> Option<[u32; RECV_ACK_INT]> {
        self.recv_log[self.recv_idx] = sn;
        self.recv_idx += 1;

        if self.recv_idx == RECV_ACK_INT {
            self.recv_idx = 0;
            return Some(self.recv_log);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_sequence_batches_of_ten() {
        let mut conn = Connection::new(test_addr(), Instant::now());
        for sn in 1..=9u32 {
            assert_eq!(conn.register_sequence(sn), None);
        }
        assert_eq!(conn.register_sequence(10), Some([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));

        // the ring restarts cleanly after a drain
        for sn in 11..=19u32 {
            assert_eq!(conn.register_sequence(sn), None);
        }
        assert_eq!(
            conn.register_sequence(20),
            Some([11, 12, 13, 14, 15, 16, 17, 18, 19, 20])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_note_received_enters_probation_after_timeout() {
        let timeout = Duration::from_secs(4);
        let mut conn = Connection::new(test_addr(), Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!conn.note_received(Instant::now(), timeout));
        assert_eq!(conn.link_state(), LinkState::Live);

        tokio::time::advance(Duration::from_secs(5)).await;
        let now = Instant::now();
        assert!(conn.note_received(now, timeout));
        assert_eq!(conn.link_state(), LinkState::Probationary { since: now });

        // further datagrams do not restart the probation window
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!conn.note_received(Instant::now(), timeout));
        assert_eq!(conn.link_state(), LinkState::Probationary { since: now });
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_completes_with_intervening_traffic() {
        let timeout = Duration::from_secs(4);
        let recovery = Duration::from_secs(5);
        let mut conn = Connection::new(test_addr(), Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        conn.note_received(Instant::now(), timeout);

        tokio::time::advance(Duration::from_secs(2)).await;
        conn.note_received(Instant::now(), timeout);
        assert_eq!(conn.tick_recovery(Instant::now(), recovery), None);

        tokio::time::advance(Duration::from_secs(4)).await;
        conn.note_received(Instant::now(), timeout);
        assert_eq!(
            conn.tick_recovery(Instant::now(), recovery),
            Some(RecoveryOutcome::Completed)
        );
        assert_eq!(conn.link_state(), LinkState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_fails_without_traffic() {
        let timeout = Duration::from_secs(4);
        let recovery = Duration::from_secs(5);
        let mut conn = Connection::new(test_addr(), Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        conn.note_received(Instant::now(), timeout);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            conn.tick_recovery(Instant::now(), recovery),
            Some(RecoveryOutcome::Failed)
        );
        assert_eq!(conn.link_state(), LinkState::TimedOut);
    }

    #[test]
    fn test_rtt_jitter_needs_two_samples() {
        let mut history = RttHistory::default();
        assert_eq!(history.jitter_ms(), 0.0);
        history.push(100);
        assert_eq!(history.jitter_ms(), 0.0);
        history.push(100);
        assert_eq!(history.jitter_ms(), 0.0);
    }

    #[test]
    fn test_rtt_jitter_ignores_zero_slots() {
        let mut history = RttHistory::default();
        history.push(100);
        history.push(0);
        history.push(200);
        // population std dev of {100, 200}
        assert!((history.jitter_ms() - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_validity_and_capability_latch() {
        let staleness = Duration::from_secs(2);
        let mut stats = ConnectionStats::default();
        assert!(!stats.has_valid_sender_telemetry(Instant::now(), staleness));
        assert!(!stats.supports_extended_keepalives());

        let telemetry = SenderTelemetry {
            conn_id: 1,
            window: 1000,
            in_flight: 100,
            rtt_ms: 30,
            nak_count: 0,
            bitrate_bytes_per_sec: 0,
        };
        stats.apply_telemetry(&telemetry, Instant::now());
        assert!(stats.has_valid_sender_telemetry(Instant::now(), staleness));
        assert!(stats.supports_extended_keepalives());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!stats.has_valid_sender_telemetry(Instant::now(), staleness));
        // capability persists even when telemetry went stale
        assert!(stats.supports_extended_keepalives());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_are_monotonic_and_snapshots_lag() {
        let mut stats = ConnectionStats::default();
        stats.record_packet(1000);
        stats.record_packet(500);
        stats.record_nak();
        assert_eq!(stats.bytes_received, 1500);
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.packets_lost, 1);
        assert_eq!(stats.last_bytes_received, 0);

        stats.finish_eval_period(5000);
        assert_eq!(stats.last_bytes_received, 1500);
        assert_eq!(stats.last_packets_received, 2);
        assert_eq!(stats.last_packets_lost, 1);
        assert_eq!(stats.last_eval_time_ms, 5000);
    }
}
