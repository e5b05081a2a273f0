use std::net::SocketAddr;
use std::time::Duration;

/// Weight tiers assigned by the load balancer, in percent of full rotation.
pub const WEIGHT_FULL: u8 = 100;
pub const WEIGHT_EXCELLENT: u8 = 85;
pub const WEIGHT_DEGRADED: u8 = 70;
pub const WEIGHT_FAIR: u8 = 55;
pub const WEIGHT_POOR: u8 = 40;
pub const WEIGHT_CRITICAL: u8 = 10;

/// Number of sequence numbers batched into one ACK datagram.
pub const RECV_ACK_INT: usize = 10;

/// Slots in the per-connection RTT history ring.
pub const RTT_HISTORY_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Local port for the bond-side (uplink-facing) socket.
    pub srtla_port: u16,
    /// Resolved address of the downstream SRT server.
    pub srt_addr: SocketAddr,

    pub max_conns_per_group: usize,
    pub max_groups: usize,

    /// Granularity of the housekeeping timer driving cleanup and evaluation.
    pub tick_interval: Duration,
    pub cleanup_period: Duration,
    pub group_timeout: Duration,
    pub conn_timeout: Duration,
    pub keepalive_period: Duration,
    /// How long a connection that resurfaced after a timeout stays probationary.
    pub recovery_chance_period: Duration,

    pub quality_eval_period: Duration,
    /// Base interval between ACK batches; stretched by 1/throttle_factor.
    pub ack_throttle_interval: Duration,
    /// Lower bound for the ACK throttle factor.
    pub min_ack_rate: f64,
    /// A group is expected to deliver at least this much in aggregate; the
    ///  per-connection floor is derived by dividing through the member count.
    pub min_acceptable_total_bandwidth_kbps: f64,
    /// Fraction of the median bandwidth below which a connection counts as poor.
    pub good_connection_threshold: f64,
    /// No penalties are applied during the first seconds of a connection's life.
    pub connection_grace_period: Duration,

    pub rtt_threshold_critical_ms: u32,
    pub rtt_threshold_high_ms: u32,
    pub rtt_threshold_moderate_ms: u32,
    /// RTT jitter (population std dev, ms) above which a penalty applies.
    pub rtt_variance_threshold_ms: f64,
    /// Sender telemetry older than this is ignored by the evaluator.
    pub keepalive_staleness_threshold: Duration,

    pub nak_rate_critical: f64,
    pub nak_rate_high: f64,
    pub nak_rate_moderate: f64,
    pub nak_rate_low: f64,

    pub window_utilization_congested: f64,
    pub bitrate_discrepancy_threshold: f64,

    pub recv_buf_size: usize,
    pub send_buf_size: usize,

    /// Directory entry prefix for the per-group advisory file.
    pub socket_info_prefix: String,
}

impl ReceiverConfig {
    pub fn new(srtla_port: u16, srt_addr: SocketAddr) -> ReceiverConfig {
        ReceiverConfig {
            srtla_port,
            srt_addr,
            max_conns_per_group: 16,
            max_groups: 200,
            tick_interval: Duration::from_secs(1),
            cleanup_period: Duration::from_secs(3),
            group_timeout: Duration::from_secs(4),
            conn_timeout: Duration::from_secs(4),
            keepalive_period: Duration::from_secs(1),
            recovery_chance_period: Duration::from_secs(5),
            quality_eval_period: Duration::from_secs(5),
            ack_throttle_interval: Duration::from_millis(100),
            min_ack_rate: 0.2,
            min_acceptable_total_bandwidth_kbps: 1000.0,
            good_connection_threshold: 0.5,
            connection_grace_period: Duration::from_secs(10),
            rtt_threshold_critical_ms: 500,
            rtt_threshold_high_ms: 200,
            rtt_threshold_moderate_ms: 100,
            rtt_variance_threshold_ms: 50.0,
            keepalive_staleness_threshold: Duration::from_secs(2),
            nak_rate_critical: 0.20,
            nak_rate_high: 0.10,
            nak_rate_moderate: 0.05,
            nak_rate_low: 0.01,
            window_utilization_congested: 0.95,
            bitrate_discrepancy_threshold: 0.20,
            recv_buf_size: 4 * 1024 * 1024,
            send_buf_size: 4 * 1024 * 1024,
            socket_info_prefix: "/tmp/srtla-group-".to_string(),
        }
    }
}
