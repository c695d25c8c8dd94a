//! Process counters exposed at `/metrics`.
//!
//! Plain atomics, rendered in Prometheus text format on demand. Gauges
//! that need a live look (spool depth, queue depth) are sampled by the
//! handler, not tracked here.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the interesting paths.
#[derive(Debug, Default)]
pub struct Metrics {
    pub uplinks_accepted: AtomicU64,
    pub uplinks_duplicate: AtomicU64,
    pub uplinks_orphan: AtomicU64,
    pub uplinks_spooled: AtomicU64,
    pub uplinks_malformed: AtomicU64,
    pub uplinks_unauthorized: AtomicU64,
    pub uplinks_rate_limited: AtomicU64,
    pub downlinks_enqueued: AtomicU64,
    pub downlinks_coalesced: AtomicU64,
    pub downlinks_superseded: AtomicU64,
    pub downlinks_sent: AtomicU64,
    pub downlinks_deferred: AtomicU64,
    pub downlinks_stuck: AtomicU64,
    pub downlinks_failed: AtomicU64,
    pub evaluations: AtomicU64,
    pub reservations_created: AtomicU64,
    pub reservations_conflicts: AtomicU64,
}

impl Metrics {
    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(64);
        let counters: [(&str, &AtomicU64); 17] = [
            ("parklane_uplinks_accepted_total", &self.uplinks_accepted),
            ("parklane_uplinks_duplicate_total", &self.uplinks_duplicate),
            ("parklane_uplinks_orphan_total", &self.uplinks_orphan),
            ("parklane_uplinks_spooled_total", &self.uplinks_spooled),
            ("parklane_uplinks_malformed_total", &self.uplinks_malformed),
            (
                "parklane_uplinks_unauthorized_total",
                &self.uplinks_unauthorized,
            ),
            (
                "parklane_uplinks_rate_limited_total",
                &self.uplinks_rate_limited,
            ),
            ("parklane_downlinks_enqueued_total", &self.downlinks_enqueued),
            (
                "parklane_downlinks_coalesced_total",
                &self.downlinks_coalesced,
            ),
            (
                "parklane_downlinks_superseded_total",
                &self.downlinks_superseded,
            ),
            ("parklane_downlinks_sent_total", &self.downlinks_sent),
            ("parklane_downlinks_deferred_total", &self.downlinks_deferred),
            ("parklane_downlinks_stuck_total", &self.downlinks_stuck),
            ("parklane_downlinks_failed_total", &self.downlinks_failed),
            ("parklane_evaluations_total", &self.evaluations),
            (
                "parklane_reservations_created_total",
                &self.reservations_created,
            ),
            (
                "parklane_reservations_conflicts_total",
                &self.reservations_conflicts,
            ),
        ];
        for (name, counter) in counters {
            lines.push(format!("# TYPE {name} counter"));
            lines.push(format!("{name} {}", counter.load(Ordering::Relaxed)));
        }
        lines.push(format!(
            "parklane_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        ));
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn render_reflects_bumps() {
        let metrics = Metrics::default();
        Metrics::bump(&metrics.uplinks_accepted);
        Metrics::bump(&metrics.uplinks_accepted);
        let text = metrics.render();
        assert!(text.contains("parklane_uplinks_accepted_total 2"));
        assert!(text.contains("parklane_info"));
    }
}
