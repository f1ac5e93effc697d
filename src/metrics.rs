//! Metric helpers for `wiregate`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking active sessions.
pub const SESSIONS_ACTIVE: &str = "wiregate_sessions_active";
/// Name of the counter tracking fragments moved over the wire.
pub const FRAGMENTS_PROCESSED: &str = "wiregate_fragments_processed_total";
/// Name of the counter tracking groups shed by the reassembly ceiling.
pub const REASSEMBLY_OVERFLOWS: &str = "wiregate_reassembly_overflows_total";
/// Name of the counter tracking acknowledged queue deliveries.
pub const DELIVERIES_ACKED: &str = "wiregate_deliveries_acked_total";
/// Name of the counter tracking negatively acknowledged queue deliveries.
pub const DELIVERIES_NACKED: &str = "wiregate_deliveries_nacked_total";

/// Direction of fragment processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Fragments received from a peer.
    Inbound,
    /// Fragments written to a peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "metrics disabled"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement the active sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a fragment for the given direction.
pub fn inc_fragments(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_PROCESSED, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a group shed by the reassembly ceiling.
pub fn inc_reassembly_overflows() {
    #[cfg(feature = "metrics")]
    counter!(REASSEMBLY_OVERFLOWS).increment(1);
}

/// Record an acknowledged delivery.
pub fn inc_acks() {
    #[cfg(feature = "metrics")]
    counter!(DELIVERIES_ACKED).increment(1);
}

/// Record a negatively acknowledged delivery.
pub fn inc_nacks() {
    #[cfg(feature = "metrics")]
    counter!(DELIVERIES_NACKED).increment(1);
}
