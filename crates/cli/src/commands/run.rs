//! `cadence run`: run simulated sessions until something stops them.
//!
//! Stop sources are Ctrl-C, the estop marker (polled every stop quantum),
//! the optional `--duration`, and every session reaching its cycle limit.

use cadence_backends::RuleTableBackend;
use cadence_config::{CadenceConfig, JitterKind};
use cadence_engine::{Runtime, SessionExit};
use cadence_safety::EstopMarker;
use cadence_telemetry::SummaryTable;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::load_config;
use crate::sim::{FlakyBackend, LoggingSink, spawn_feeder};

#[derive(Debug, Default)]
pub struct RunOptions {
    pub sessions: Option<u32>,
    pub cycles: Option<u64>,
    pub duration: Option<u64>,
    pub seed: Option<u64>,
    pub no_jitter: bool,
}

impl RunOptions {
    fn apply(&self, config: &mut CadenceConfig) {
        if self.no_jitter {
            config.scheduler.jitter = JitterKind::None;
        }
        if let Some(cycles) = self.cycles {
            config.session.max_cycles = cycles;
        }
    }
}

/// What ended the supervision loop.
#[derive(Debug, PartialEq)]
enum StopCause {
    CtrlC,
    Estop,
    Deadline,
    AllFinished,
}

pub async fn run(path: Option<&Path>, options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    options.apply(&mut config);

    let marker = EstopMarker::default_location();
    if marker.is_engaged() {
        return Err(format!(
            "emergency stop is engaged ({}); release it with `cadence estop --resume`",
            marker.path().display()
        )
        .into());
    }

    let runtime = Arc::new(build_runtime(config, options.seed)?);
    let config = runtime.config();
    let count = options.sessions.unwrap_or(config.simulation.sessions);
    let sessions = runtime.spawn_configured(count)?;

    println!("🎣 Cadence: running {} session(s)", sessions.len());
    println!("   Chain:     {}", config.backends.fallback_chain.join(" → "));
    println!("   Threshold: {}", config.decision.acceptance_threshold);
    println!("   Jitter:    {:?}", config.scheduler.jitter);
    println!("   Press Ctrl-C to stop.");
    println!();

    let feeder = spawn_feeder(
        runtime.clone(),
        sessions,
        Duration::from_millis(config.simulation.observation_interval_ms),
        options.seed,
    );

    let deadline = options
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let quantum = Duration::from_millis(config.session.stop_quantum_ms);
    let cause = supervise(&runtime, &marker, quantum, deadline).await;
    info!(cause = ?cause, "Supervision ended");

    match cause {
        StopCause::CtrlC => {
            runtime.stop_all("ctrl-c");
        }
        StopCause::Estop => {
            runtime.stop_all("estop");
        }
        StopCause::Deadline => {
            runtime.stop_all("duration");
        }
        StopCause::AllFinished => {}
    }

    feeder.abort();
    let outcomes = runtime.join_all().await;

    println!();
    for outcome in &outcomes {
        let exit = match &outcome.exit {
            Ok(SessionExit::Stopped(reason)) => format!("stopped ({reason})"),
            Ok(SessionExit::CycleLimit) => "cycle limit reached".to_string(),
            Ok(SessionExit::FeedClosed) => "feed closed".to_string(),
            Err(e) => format!("error: {e}"),
        };
        println!("   {}: {exit}", outcome.session_id);
    }
    println!();
    print!("{}", SummaryTable::new(&runtime.reports()));
    Ok(())
}

fn build_runtime(config: CadenceConfig, seed: Option<u64>) -> Result<Runtime, Box<dyn std::error::Error>> {
    let sim = config.simulation.clone();
    let sink = Arc::new(LoggingSink::new(sim.sink_failure_rate, sim.sink_fatal_rate, seed));

    let flaky: Vec<FlakyBackend> = config
        .backends
        .rule_tables
        .iter()
        .filter_map(|table| {
            let rate = sim.backend_failure_rates.get(&table.id).copied()?;
            let inner = Arc::new(RuleTableBackend::from_config(table));
            Some(FlakyBackend::new(inner, rate, seed))
        })
        .collect();

    let mut builder = Runtime::builder(config, sink);
    for backend in flaky {
        builder = builder.backend(Arc::new(backend));
    }
    if let Some(seed) = seed {
        builder = builder.seed(seed);
    }
    Ok(builder.build()?)
}

/// Wait for a stop source. Ctrl-C is handled immediately; the estop
/// marker, the deadline and session completion are checked every quantum.
async fn supervise(
    runtime: &Runtime,
    marker: &EstopMarker,
    quantum: Duration,
    deadline: Option<Instant>,
) -> StopCause {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(quantum);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return StopCause::CtrlC,
            _ = ticker.tick() => {
                if marker.is_engaged() {
                    warn!(marker = %marker.path().display(), "Emergency stop marker found");
                    return StopCause::Estop;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return StopCause::Deadline;
                }
                if runtime.running().is_empty() {
                    return StopCause::AllFinished;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.audit.log_entries = false;
        config.scheduler.min_delay_ms = 10;
        config.scheduler.max_delay_ms = 20;
        config.scheduler.base_cooldown_ms = 10;
        config.simulation.sink_failure_rate = 0.0;
        config
    }

    #[test]
    fn options_override_config() {
        let mut config = CadenceConfig::default();
        RunOptions {
            cycles: Some(7),
            no_jitter: true,
            ..RunOptions::default()
        }
        .apply(&mut config);
        assert_eq!(config.session.max_cycles, 7);
        assert_eq!(config.scheduler.jitter, JitterKind::None);
    }

    #[tokio::test(start_paused = true)]
    async fn estop_marker_ends_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let marker = EstopMarker::new(dir.path().join(".estop"));
        let runtime = build_runtime(quick_config(), Some(1)).unwrap();
        runtime.spawn_configured(1).unwrap();

        marker.engage().unwrap();
        let cause = supervise(&runtime, &marker, Duration::from_millis(50), None).await;
        assert_eq!(cause, StopCause::Estop);

        runtime.stop_all("estop");
        runtime.join_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finished_sessions_end_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let marker = EstopMarker::new(dir.path().join(".estop"));
        let mut config = quick_config();
        config.session.max_cycles = 2;
        config.session.observation_timeout_ms = 100;
        let runtime = build_runtime(config, Some(1)).unwrap();
        runtime.spawn_configured(2).unwrap();

        let cause = supervise(&runtime, &marker, Duration::from_millis(50), None).await;
        assert_eq!(cause, StopCause::AllFinished);
        let outcomes = runtime.join_all().await;
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.exit, Ok(SessionExit::CycleLimit))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_supervision() {
        let dir = tempfile::tempdir().unwrap();
        let marker = EstopMarker::new(dir.path().join(".estop"));
        let runtime = build_runtime(quick_config(), Some(1)).unwrap();
        runtime.spawn_configured(1).unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        let cause = supervise(&runtime, &marker, Duration::from_millis(50), Some(deadline)).await;
        assert_eq!(cause, StopCause::Deadline);

        runtime.stop_all("duration");
        runtime.join_all().await;
    }

    #[test]
    fn configured_outages_wrap_rule_tables() {
        let mut config = quick_config();
        config.simulation.backend_failure_rates.insert("primary".into(), 1.0);
        let runtime = build_runtime(config, Some(1)).unwrap();
        assert_eq!(runtime.backends().len(), 2);
    }
}
