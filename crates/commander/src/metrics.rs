use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory commander counters exposed at `/metrics` in Prometheus format.
#[derive(Default)]
pub struct Metrics {
    pub missions_submitted_total: AtomicU64,
    pub dispatch_errors_total: AtomicU64,
    pub reports_accepted_total: AtomicU64,
    pub reports_unauthenticated_total: AtomicU64,
    pub reports_unknown_status_total: AtomicU64,
    pub reports_undecodable_total: AtomicU64,
    pub reports_unknown_mission_total: AtomicU64,
    pub tokens_rotated_total: AtomicU64,
    pub rotations_forbidden_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self, missions_tracked: usize) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, value: &AtomicU64| {
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
        };
        counter("commander_missions_submitted_total", &self.missions_submitted_total);
        counter("commander_dispatch_errors_total", &self.dispatch_errors_total);
        counter("commander_reports_accepted_total", &self.reports_accepted_total);
        counter(
            "commander_reports_unauthenticated_total",
            &self.reports_unauthenticated_total,
        );
        counter(
            "commander_reports_unknown_status_total",
            &self.reports_unknown_status_total,
        );
        counter("commander_reports_undecodable_total", &self.reports_undecodable_total);
        counter(
            "commander_reports_unknown_mission_total",
            &self.reports_unknown_mission_total,
        );
        counter("commander_tokens_rotated_total", &self.tokens_rotated_total);
        counter("commander_rotations_forbidden_total", &self.rotations_forbidden_total);
        out.push_str("# TYPE commander_missions_tracked gauge\n");
        out.push_str(&format!("commander_missions_tracked {missions_tracked}\n"));
        out
    }
}
