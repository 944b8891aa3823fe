//! End-of-run summary table.

use crate::model::SessionReport;
use std::fmt::Write;

/// Renders session reports as a fixed-width text table.
pub struct SummaryTable<'a> {
    reports: &'a [SessionReport],
}

impl<'a> SummaryTable<'a> {
    pub fn new(reports: &'a [SessionReport]) -> Self {
        Self { reports }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>9}  {:<12} {:<18}",
            "Session", "Cycles", "Actions", "No-ops", "Missed", "Retries", "Breaks", "Delay", "Backend", "State"
        );
        let _ = writeln!(out, "{}", "─".repeat(104));

        for report in self.reports {
            let s = &report.stats;
            let delay = s
                .mean_delay_ms()
                .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
            let state = s
                .final_state
                .map_or_else(|| "-".to_string(), |st| st.to_string());
            let _ = writeln!(
                out,
                "{:<12} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>9}  {:<12} {:<18}",
                report.session_id.as_str(),
                s.cycles,
                s.actions,
                s.total_no_ops(),
                s.missed_cycles,
                s.retries,
                s.breaks,
                delay,
                s.top_backend().unwrap_or("-"),
                state,
            );
        }

        let stopped: Vec<&SessionReport> = self
            .reports
            .iter()
            .filter(|r| r.stats.stop_reason.is_some())
            .collect();
        if !stopped.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Stopped sessions:");
            for report in stopped {
                let _ = writeln!(
                    out,
                    "  {}: {}",
                    report.session_id,
                    report.stats.stop_reason.as_deref().unwrap_or_default()
                );
            }
        }

        out
    }
}

impl std::fmt::Display for SummaryTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStats;
    use cadence_core::session::{LifecycleState, SessionId};

    fn report(id: &str, stats: SessionStats) -> SessionReport {
        SessionReport {
            session_id: SessionId::from(id),
            stats,
        }
    }

    #[test]
    fn renders_one_row_per_session() {
        let mut busy = SessionStats {
            cycles: 12,
            actions: 5,
            plans: 5,
            total_delay_ms: 2500,
            final_state: Some(LifecycleState::Cooldown),
            ..Default::default()
        };
        busy.backend_usage.insert("primary".into(), 5);

        let reports = vec![report("s1", busy), report("s2", SessionStats::default())];
        let table = SummaryTable::new(&reports).render();
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Session"));
        assert!(lines[2].contains("s1"));
        assert!(lines[2].contains("500ms"));
        assert!(lines[2].contains("primary"));
        assert!(lines[2].contains("COOLDOWN"));
        assert!(!table.contains("Stopped sessions"));
    }

    #[test]
    fn stopped_sessions_are_listed_with_their_reason() {
        let stats = SessionStats {
            final_state: Some(LifecycleState::EmergencyStopped),
            stop_reason: Some("external stop from ctrl-c".into()),
            ..Default::default()
        };
        let reports = vec![report("s1", stats)];
        let table = SummaryTable::new(&reports).to_string();
        assert!(table.contains("EMERGENCY_STOPPED"));
        assert!(table.contains("s1: external stop from ctrl-c"));
    }
}
