//! Metrics emission point (§1): the core reports counters/gauges through
//! this trait instead of depending on a specific exporter, so a caller can
//! wire in `metrics`/`prometheus` without pulling either into this crate.

pub trait Metrics: Send + Sync {
    /// A per-session dispatch channel was full; the dispatch was dropped
    /// for that subscriber only (§4.4 backpressure policy).
    fn channel_blocked(&self, session_id: &str) {
        let _ = session_id;
    }

    /// A raw Redis message failed to decode into the opcode's payload type.
    fn digest_decode_error(&self) {}

    /// Gauge: current count of admitted connections (§4.9 periodic report).
    fn active_connections(&self, count: u32) {
        let _ = count;
    }
}

/// Default no-op implementation, used when the embedder hasn't wired a
/// real exporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
