//! Connection quality scoring.
//!
//! Each evaluation recomputes a connection's error points from scratch, from
//!  two kinds of input:
//!
//! * receiver-side metrics (always available): measured bandwidth against the
//!   group median, and the packet loss ratio derived from accepted NAKs;
//! * sender telemetry (when the sender emits extended keepalives): RTT level
//!   and jitter, the sender's own NAK rate, congestion window occupancy, and a
//!   bitrate cross-check.
//!
//! Senders that are known to support extended keepalives get a much softer
//!  bandwidth penalty schedule. Bandwidth feeds the ACK throttle, and the ACK
//!  throttle feeds the sender's link selection - with the aggressive schedule a
//!  capable uplink that merely went idle would measure as slow, get throttled,
//!  be used even less, and lock itself out permanently. The capability latch
//!  (not the freshness of the last keepalive) decides which schedule applies,
//!  so the treatment is the same whether the uplink is busy or idle.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ReceiverConfig;
use crate::connection::{ConnectionStats, Group};

/// Per-member receiver-side measurements for one evaluation window.
#[derive(Debug, Clone, Copy, Default)]
struct WindowMetrics {
    bandwidth_kbps: f64,
    loss_ratio: f64,
    packets_diff: u64,
}

/// Score every member of the group, at most once per evaluation period.
///
/// `force` bypasses the period check; it is used when a burst of NAKs calls
///  for an out-of-schedule evaluation.
pub fn evaluate_group(
    group: &mut Group,
    now: Instant,
    now_ms: u64,
    config: &ReceiverConfig,
    force: bool,
) {
    if group.conns.is_empty() || !group.load_balancing_enabled {
        return;
    }
    if !force {
        if let Some(last) = group.last_quality_eval {
            if now.saturating_duration_since(last) < config.quality_eval_period {
                return;
            }
        }
    }

    debug!(group = %group.id().short(), "evaluating connection quality");
    let mut total_bytes_per_sec: u64 = 0;

    let mut window: Vec<WindowMetrics> = Vec::with_capacity(group.conns.len());
    for conn in &group.conns {
        let stats = &conn.stats;
        let time_diff_ms = if stats.last_eval_time_ms > 0 {
            now_ms.saturating_sub(stats.last_eval_time_ms)
        } else {
            0
        };

        let mut metrics = WindowMetrics::default();
        if time_diff_ms > 0 {
            let bytes_diff = stats.bytes_received - stats.last_bytes_received;
            let lost_diff = stats.packets_lost - stats.last_packets_lost;
            metrics.packets_diff = stats.packets_received - stats.last_packets_received;

            let seconds = time_diff_ms as f64 / 1000.0;
            let bandwidth_bytes_per_sec = bytes_diff as f64 / seconds;
            metrics.bandwidth_kbps = bandwidth_bytes_per_sec * 8.0 / 1000.0;

            if metrics.packets_diff > 0 {
                metrics.loss_ratio = lost_diff as f64 / (metrics.packets_diff + lost_diff) as f64;
            }

            total_bytes_per_sec += bandwidth_bytes_per_sec as u64;
        }
        window.push(metrics);
    }
    group.total_target_bandwidth = total_bytes_per_sec;

    let max_kbps = window.iter().map(|m| m.bandwidth_kbps).fold(0.0, f64::max);
    let median_kbps = median_bandwidth(&window, max_kbps, config.good_connection_threshold);
    let min_expected_kbps = f64::max(
        100.0,
        config.min_acceptable_total_bandwidth_kbps / window.len() as f64,
    );

    debug!(
        group = %group.id().short(),
        "bandwidth: total {:.2} kbit/s, max {:.2} kbit/s, median {:.2} kbit/s, min expected per conn {:.2} kbit/s",
        group.total_target_bandwidth as f64 * 8.0 / 1000.0,
        max_kbps,
        median_kbps,
        min_expected_kbps,
    );

    let group_id = group.id();
    for (conn, metrics) in group.conns.iter_mut().zip(&window) {
        let peer = conn.peer();
        let connection_start = conn.connection_start();
        let stats = &mut conn.stats;

        if now.saturating_duration_since(connection_start) < config.connection_grace_period {
            // no penalties while the connection finds its feet, but the period
            //  snapshots still advance so the first scored window has a real
            //  baseline instead of an all-time delta
            debug!(%peer, group = %group_id.short(), "connection in grace period, skipping penalties");
            stats.error_points = 0;
            stats.telemetry.last_sender_nak_count = stats.telemetry.sender_nak_count;
            stats.finish_eval_period(now_ms);
            stats.nack_count = 0;
            continue;
        }

        stats.error_points = 0;

        let is_poor = metrics.bandwidth_kbps < median_kbps * config.good_connection_threshold;
        let expected_kbps = f64::max(
            if is_poor { min_expected_kbps } else { median_kbps },
            min_expected_kbps,
        );
        let performance_ratio = if expected_kbps > 0.0 {
            metrics.bandwidth_kbps / expected_kbps
        } else {
            0.0
        };

        stats.error_points += bandwidth_error_points(
            performance_ratio,
            stats.supports_extended_keepalives(),
        );
        stats.error_points += loss_error_points(metrics.loss_ratio);

        let has_telemetry =
            stats.has_valid_sender_telemetry(now, config.keepalive_staleness_threshold);
        let mut telemetry_points = 0;
        if has_telemetry {
            telemetry_points += rtt_error_points(stats, config);
            telemetry_points += nak_rate_error_points(stats, metrics.packets_diff, config);
            telemetry_points += window_error_points(stats, config);
            stats.error_points += telemetry_points;

            let receiver_bps = metrics.bandwidth_kbps * 125.0;
            check_bitrate_discrepancy(peer, stats, receiver_bps, config);
        }

        stats.finish_eval_period(now_ms);
        stats.nack_count = 0;

        debug!(
            %peer,
            group = %group_id.short(),
            "connection stats: bw {:.2} kbit/s, loss {:.2}%, error points {} ({}; telemetry points {})",
            metrics.bandwidth_kbps,
            metrics.loss_ratio * 100.0,
            stats.error_points,
            if has_telemetry { "receiver + sender telemetry" } else { "receiver-only" },
            telemetry_points,
        );
    }

    group.last_quality_eval = Some(now);
}

/// Median bandwidth over the members doing at least half as well as the best
///  one; if the filter leaves nothing, over all members.
fn median_bandwidth(window: &[WindowMetrics], max_kbps: f64, good_threshold: f64) -> f64 {
    if window.is_empty() || max_kbps <= 0.0 {
        return 0.0;
    }

    let good_cutoff = max_kbps * good_threshold;
    let mut good: Vec<f64> = window
        .iter()
        .map(|m| m.bandwidth_kbps)
        .filter(|bw| *bw >= good_cutoff)
        .collect();
    if good.is_empty() {
        good = window.iter().map(|m| m.bandwidth_kbps).collect();
    }

    good.sort_by(|a, b| a.total_cmp(b));
    let mid = good.len() / 2;
    if good.len() % 2 == 0 {
        (good[mid - 1] + good[mid]) / 2.0
    } else {
        good[mid]
    }
}

/// Bandwidth penalty schedule. The softened numbers for extended-keepalive
///  senders are the anti-feedback rule described in the module docs.
fn bandwidth_error_points(performance_ratio: f64, extended_keepalives: bool) -> u32 {
    let schedule: [(f64, u32); 4] = if extended_keepalives {
        [(0.3, 10), (0.5, 7), (0.7, 4), (0.85, 2)]
    } else {
        [(0.3, 40), (0.5, 25), (0.7, 15), (0.85, 5)]
    };

    for (threshold, points) in schedule {
        if performance_ratio < threshold {
            return points;
        }
    }
    0
}

fn loss_error_points(loss_ratio: f64) -> u32 {
    if loss_ratio > 0.20 {
        40
    } else if loss_ratio > 0.10 {
        20
    } else if loss_ratio > 0.05 {
        10
    } else if loss_ratio > 0.01 {
        5
    } else {
        0
    }
}

/// RTT level and jitter penalties from sender telemetry (milliseconds).
fn rtt_error_points(stats: &ConnectionStats, config: &ReceiverConfig) -> u32 {
    let rtt_ms = stats.telemetry.rtt_ms;
    let mut points = 0;
    if rtt_ms > config.rtt_threshold_critical_ms {
        points += 20;
    } else if rtt_ms > config.rtt_threshold_high_ms {
        points += 10;
    } else if rtt_ms > config.rtt_threshold_moderate_ms {
        points += 5;
    }

    if stats.telemetry.rtt_history.jitter_ms() > config.rtt_variance_threshold_ms {
        points += 10;
    }
    points
}

/// Sender-side NAK rate over the same window the bandwidth was measured on.
///  Updates the snapshot afterwards, so each evaluation scores fresh NAKs only.
fn nak_rate_error_points(
    stats: &mut ConnectionStats,
    packets_diff: u64,
    config: &ReceiverConfig,
) -> u32 {
    if packets_diff == 0 || stats.telemetry.sender_nak_count == 0 {
        return 0;
    }

    let nak_diff = stats
        .telemetry
        .sender_nak_count
        .saturating_sub(stats.telemetry.last_sender_nak_count);
    let nak_rate = f64::from(nak_diff) / packets_diff as f64;

    let points = if nak_rate > config.nak_rate_critical {
        40
    } else if nak_rate > config.nak_rate_high {
        20
    } else if nak_rate > config.nak_rate_moderate {
        10
    } else if nak_rate > config.nak_rate_low {
        5
    } else {
        0
    };

    stats.telemetry.last_sender_nak_count = stats.telemetry.sender_nak_count;
    points
}

/// A persistently full congestion window indicates the path is the bottleneck.
///  Low occupancy is not penalized.
fn window_error_points(stats: &ConnectionStats, config: &ReceiverConfig) -> u32 {
    if stats.telemetry.window <= 0 {
        return 0;
    }
    let utilization = f64::from(stats.telemetry.in_flight) / f64::from(stats.telemetry.window);
    if utilization > config.window_utilization_congested {
        15
    } else {
        0
    }
}

/// Cross-check the sender's advertised bitrate against what actually arrived.
///  Informational only; a large discrepancy is worth a warning but no points.
fn check_bitrate_discrepancy(
    peer: std::net::SocketAddr,
    stats: &ConnectionStats,
    receiver_bps: f64,
    config: &ReceiverConfig,
) {
    let sender_bps = f64::from(stats.telemetry.sender_bitrate_bps);
    if sender_bps <= 0.0 {
        return;
    }
    let ratio = (receiver_bps - sender_bps).abs() / sender_bps;
    if ratio > config.bitrate_discrepancy_threshold {
        warn!(
            %peer,
            "large bitrate discrepancy: sender {} bytes/s, receiver {} bytes/s ({:.1}%)",
            stats.telemetry.sender_bitrate_bps,
            receiver_bps as u64,
            ratio * 100.0,
        );
    }
}
