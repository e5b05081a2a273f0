//! Weight and ACK-throttle adjustment.
//!
//! Runs right after a quality evaluation and translates each member's error
//!  points into a discrete weight tier, then into an ACK throttle factor. The
//!  throttle is the only actuator the receiver has: a sender observing slower
//!  ACKs shifts traffic away from the link on its own.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{
    ReceiverConfig, WEIGHT_CRITICAL, WEIGHT_DEGRADED, WEIGHT_EXCELLENT, WEIGHT_FAIR, WEIGHT_FULL,
    WEIGHT_POOR,
};
use crate::connection::Group;

/// Throttle factor below which a telemetry-capable member qualifies for the
///  recovery boost, the boost amount, and the ceiling it may reach.
const RECOVERY_BOOST_BELOW: f64 = 0.5;
const RECOVERY_BOOST: f64 = 0.15;
const RECOVERY_BOOST_CEILING: f64 = 0.6;
/// Error points below which a member counts as improving.
const RECOVERY_BOOST_MAX_ERROR_POINTS: u32 = 15;

pub fn weight_for_error_points(error_points: u32) -> u8 {
    if error_points >= 40 {
        WEIGHT_CRITICAL
    } else if error_points >= 25 {
        WEIGHT_POOR
    } else if error_points >= 15 {
        WEIGHT_FAIR
    } else if error_points >= 10 {
        WEIGHT_DEGRADED
    } else if error_points >= 5 {
        WEIGHT_EXCELLENT
    } else {
        WEIGHT_FULL
    }
}

/// Recompute weight tiers and ACK throttle factors for every member.
///
/// With load balancing enabled this is a no-op unless a quality evaluation
///  happened since the last adjustment; with it disabled it still runs on a
///  coarse schedule, only to force every throttle back to 1.0.
pub fn adjust_weights(group: &mut Group, now: Instant, config: &ReceiverConfig) {
    if group.conns.is_empty() {
        return;
    }

    let enabled = group.load_balancing_enabled;
    if enabled {
        let Some(last_quality_eval) = group.last_quality_eval else {
            return;
        };
        if let Some(last) = group.last_load_balance_eval {
            if last >= last_quality_eval {
                return;
            }
        }
    } else if let Some(last) = group.last_load_balance_eval {
        if now.saturating_duration_since(last) < config.quality_eval_period {
            return;
        }
    }
    group.last_load_balance_eval = Some(now);

    let group_id = group.id();
    let mut any_change = false;
    debug!(
        group = %group_id.short(),
        "evaluating weights and throttle factors for {} connections",
        group.conns.len()
    );

    let mut max_weight: u8 = 0;
    let mut active_conns = 0;
    for conn in &mut group.conns {
        let new_weight = weight_for_error_points(conn.stats.error_points);
        if new_weight != conn.stats.weight_percent {
            conn.stats.weight_percent = new_weight;
            any_change = true;
        }

        if !conn.timed_out(now, config.conn_timeout) {
            max_weight = max_weight.max(conn.stats.weight_percent);
            active_conns += 1;
        }
    }

    debug!(
        group = %group_id.short(),
        active_conns, max_weight, enabled,
        "throttle inputs"
    );

    if enabled && active_conns > 1 {
        for conn in &mut group.conns {
            let old_throttle = conn.stats.ack_throttle_factor;
            let weight = f64::from(conn.stats.weight_percent);
            let absolute_quality = weight / f64::from(WEIGHT_FULL);
            let relative_quality = if max_weight > 0 {
                weight / f64::from(max_weight)
            } else {
                0.0
            };
            let computed = absolute_quality.min(relative_quality).max(config.min_ack_rate);

            // Recovery boost: an improving telemetry-capable member that is
            //  still deep in throttling is ramped back up in 0.15 steps toward
            //  0.6 instead of snapping straight to its tier value - the link
            //  just proved itself at a trickle, not at full rate.
            let new_throttle = if conn.stats.supports_extended_keepalives()
                && old_throttle < RECOVERY_BOOST_BELOW
                && conn.stats.error_points < RECOVERY_BOOST_MAX_ERROR_POINTS
            {
                (old_throttle + RECOVERY_BOOST).min(RECOVERY_BOOST_CEILING)
            } else {
                computed
            };

            if (old_throttle - new_throttle).abs() > 0.01 {
                conn.stats.ack_throttle_factor = new_throttle;
                any_change = true;
                debug!(
                    peer = %conn.peer(),
                    "throttle factor updated: {:.2} -> {:.2}",
                    old_throttle, new_throttle
                );
            }
        }
    } else {
        for conn in &mut group.conns {
            if conn.stats.ack_throttle_factor != 1.0 {
                conn.stats.ack_throttle_factor = 1.0;
                any_change = true;
            }
        }
    }

    if any_change {
        info!(group = %group_id.short(), "connection parameters adjusted:");
        for conn in &group.conns {
            info!(
                peer = %conn.peer(),
                "  weight {}%, throttle {:.2}, error points {}, bytes {}, packets {}, lost {}",
                conn.stats.weight_percent,
                conn.stats.ack_throttle_factor,
                conn.stats.error_points,
                conn.stats.bytes_received,
                conn.stats.packets_received,
                conn.stats.packets_lost,
            );
        }
    } else {
        debug!(group = %group_id.short(), "no weight or throttle adjustments needed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::*;

    use crate::connection::Connection;
    use crate::protocol::wire::SenderTelemetry;
    use super::*;

    fn test_config() -> ReceiverConfig {
        ReceiverConfig::new(5000, "127.0.0.1:4001".parse().unwrap())
    }

    fn group_with_points(points: &[u32]) -> Group {
        let now = Instant::now();
        let mut group = Group::new(&[8u8; 16], now);
        for (i, p) in points.iter().enumerate() {
            let mut conn = Connection::new(format!("10.0.0.{}:100", i + 1).parse().unwrap(), now);
            conn.stats.error_points = *p;
            group.conns.push(conn);
        }
        // pretend a quality evaluation just happened
        group.last_quality_eval = Some(now);
        group
    }

    #[rstest]
    #[case(0, WEIGHT_FULL)]
    #[case(4, WEIGHT_FULL)]
    #[case(5, WEIGHT_EXCELLENT)]
    #[case(9, WEIGHT_EXCELLENT)]
    #[case(10, WEIGHT_DEGRADED)]
    #[case(14, WEIGHT_DEGRADED)]
    #[case(15, WEIGHT_FAIR)]
    #[case(24, WEIGHT_FAIR)]
    #[case(25, WEIGHT_POOR)]
    #[case(39, WEIGHT_POOR)]
    #[case(40, WEIGHT_CRITICAL)]
    #[case(1000, WEIGHT_CRITICAL)]
    fn test_weight_tiers(#[case] error_points: u32, #[case] weight: u8) {
        assert_eq!(weight_for_error_points(error_points), weight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_derivation() {
        let config = test_config();
        let mut group = group_with_points(&[0, 40, 16]);
        adjust_weights(&mut group, Instant::now(), &config);

        // healthy member at max weight keeps full rate
        assert_eq!(group.conns[0].stats.ack_throttle_factor, 1.0);
        // critical member clamps at the floor: min(0.1, 0.1) -> 0.2
        assert_eq!(group.conns[1].stats.ack_throttle_factor, 0.2);
        // fair member: min(55/100, 55/100) = 0.55
        assert!((group.conns[2].stats.ack_throttle_factor - 0.55).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_is_never_throttled() {
        let config = test_config();
        let mut group = group_with_points(&[40]);
        group.conns[0].stats.ack_throttle_factor = 0.2;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[0].stats.ack_throttle_factor, 1.0);
        assert_eq!(group.conns[0].stats.weight_percent, WEIGHT_CRITICAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_load_balancing_forces_full_rate() {
        let config = test_config();
        let mut group = group_with_points(&[40, 0]);
        group.load_balancing_enabled = false;
        group.conns[0].stats.ack_throttle_factor = 0.2;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[0].stats.ack_throttle_factor, 1.0);

        // and runs only on the coarse schedule while disabled
        group.conns[0].stats.ack_throttle_factor = 0.3;
        tokio::time::advance(Duration::from_secs(1)).await;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[0].stats.ack_throttle_factor, 0.3);

        tokio::time::advance(config.quality_eval_period).await;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[0].stats.ack_throttle_factor, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_when_no_new_quality_eval() {
        let config = test_config();
        let mut group = group_with_points(&[0, 40]);
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[1].stats.ack_throttle_factor, 0.2);

        // no fresh evaluation: changing the points has no effect yet
        group.conns[1].stats.error_points = 0;
        tokio::time::advance(Duration::from_secs(1)).await;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[1].stats.weight_percent, WEIGHT_CRITICAL);

        group.last_quality_eval = Some(Instant::now());
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[1].stats.weight_percent, WEIGHT_FULL);
        assert_eq!(group.conns[1].stats.ack_throttle_factor, 1.0);
    }

    fn extended_telemetry() -> SenderTelemetry {
        SenderTelemetry {
            conn_id: 1,
            window: 1000,
            in_flight: 10,
            rtt_ms: 20,
            nak_count: 0,
            bitrate_bytes_per_sec: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_boost_ramps_improving_extended_sender() {
        let config = test_config();
        // member 1 was throttled to the floor in an earlier pass and has now
        //  improved to under 15 error points
        let mut group = group_with_points(&[0, 10]);
        group.conns[1].stats.apply_telemetry(&extended_telemetry(), Instant::now());
        group.conns[1].stats.ack_throttle_factor = 0.2;

        adjust_weights(&mut group, Instant::now(), &config);
        assert!((group.conns[1].stats.ack_throttle_factor - 0.35).abs() < 1e-9);

        // each further pass (after a fresh evaluation) steps up by 0.15 until
        //  the 0.5 boundary...
        tokio::time::advance(Duration::from_millis(10)).await;
        group.last_quality_eval = Some(Instant::now());
        adjust_weights(&mut group, Instant::now(), &config);
        assert!((group.conns[1].stats.ack_throttle_factor - 0.5).abs() < 1e-9);

        // ...after which the member snaps to its tier value
        tokio::time::advance(Duration::from_millis(10)).await;
        group.last_quality_eval = Some(Instant::now());
        adjust_weights(&mut group, Instant::now(), &config);
        assert!((group.conns[1].stats.ack_throttle_factor - 0.7).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_boost_is_capped_at_ceiling() {
        let config = test_config();
        let mut group = group_with_points(&[0, 0]);
        group.conns[1].stats.apply_telemetry(&extended_telemetry(), Instant::now());
        group.conns[1].stats.ack_throttle_factor = 0.48;

        adjust_weights(&mut group, Instant::now(), &config);
        assert!((group.conns[1].stats.ack_throttle_factor - 0.6).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_boost_for_legacy_or_still_bad_members() {
        let config = test_config();

        // legacy sender: jumps straight to its tier value, no ramp
        let mut group = group_with_points(&[0, 10]);
        group.conns[1].stats.ack_throttle_factor = 0.2;
        adjust_weights(&mut group, Instant::now(), &config);
        assert!((group.conns[1].stats.ack_throttle_factor - 0.7).abs() < 1e-9);

        // extended sender with too many error points stays at the floor
        let mut group = group_with_points(&[0, 40]);
        group.conns[1].stats.apply_telemetry(&extended_telemetry(), Instant::now());
        group.conns[1].stats.ack_throttle_factor = 0.2;
        adjust_weights(&mut group, Instant::now(), &config);
        assert_eq!(group.conns[1].stats.ack_throttle_factor, 0.2);
    }
}
