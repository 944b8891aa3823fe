//! Stealth scheduler: assigns each accepted candidate a human-paced
//! dispatch time.
//!
//! A delay is drawn from `[min_delay, max_delay]`, stretched toward
//! `max_delay` as fatigue builds, and extended by a break once fatigue
//! crosses its threshold. Fatigue and the random source are per session:
//! every controller owns its own scheduler.

use cadence_config::{JitterKind, SchedulerConfig};
use cadence_core::action::{ActionCandidate, ActionPlan, NoOpReason, Schedule};
use cadence_core::session::{SessionState, clamp_unit};
use cadence_core::Observation;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info};

/// How fatigue rises with activity and falls with rest.
#[derive(Debug, Clone)]
pub struct FatigueModel {
    pub increment: f64,
    pub decay_per_sec: f64,
    pub threshold: f64,
    pub slowdown: f64,
    pub base_cooldown: Duration,
    pub fatigue_cooldown: Duration,
}

impl From<&SchedulerConfig> for FatigueModel {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            increment: config.fatigue_increment,
            decay_per_sec: config.fatigue_decay_per_sec,
            threshold: config.fatigue_threshold,
            slowdown: config.fatigue_slowdown,
            base_cooldown: Duration::from_millis(config.base_cooldown_ms),
            fatigue_cooldown: Duration::from_millis(config.fatigue_cooldown_ms),
        }
    }
}

impl FatigueModel {
    /// Whether this fatigue level forces a break on the next action.
    pub fn needs_break(&self, level: f64) -> bool {
        level >= self.threshold
    }

    /// Fatigue after one more action.
    pub fn after_action(&self, level: f64) -> f64 {
        clamp_unit(level + self.increment)
    }

    /// Fatigue after resting for `idle`.
    pub fn after_rest(&self, level: f64, idle: Duration) -> f64 {
        clamp_unit(level - self.decay_per_sec * idle.as_secs_f64())
    }

    /// Pause between cycles: longer when tired.
    pub fn cooldown(&self, level: f64) -> Duration {
        self.base_cooldown + self.fatigue_cooldown.mul_f64(clamp_unit(level))
    }

    /// Pull a sampled delay toward `max_ms` in proportion to fatigue.
    fn stretch(&self, sample_ms: f64, max_ms: f64, level: f64) -> f64 {
        let pull = clamp_unit(level * self.slowdown);
        (sample_ms + pull * (max_ms - sample_ms)).min(max_ms)
    }
}

pub struct StealthScheduler {
    config: SchedulerConfig,
    fatigue: FatigueModel,
    rng: StdRng,
}

impl StealthScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_rng(config, StdRng::from_rng(&mut rand::rng()))
    }

    /// A scheduler with a reproducible random source.
    pub fn seeded(config: SchedulerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: SchedulerConfig, rng: StdRng) -> Self {
        let fatigue = FatigueModel::from(&config);
        Self {
            config,
            fatigue,
            rng,
        }
    }

    pub fn fatigue(&self) -> &FatigueModel {
        &self.fatigue
    }

    /// Turn an accepted candidate into a plan, or a no-op if the dispatch
    /// would land outside the latency budget. Fatigue is only updated when
    /// a plan is produced.
    pub fn schedule(
        &mut self,
        candidate: ActionCandidate,
        observation: &Observation,
        state: &mut SessionState,
    ) -> Schedule {
        let min = self.config.min_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let base = (min + max) / 2.0;

        let sample = self.sample(min, max);
        let level = state.fatigue_level();
        let stretched = self.fatigue.stretch(sample, max, level);
        let jitter_ms = (sample - base).round() as i64;

        let break_applied = state.break_due || self.fatigue.needs_break(level);
        let mut delay_ms = stretched.round().clamp(min, max) as u64;
        if break_applied {
            delay_ms += self.config.break_extension_ms;
        }

        let age = observation.age(Utc::now());
        let latency_ms = u64::try_from(age.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_add(delay_ms);
        if latency_ms > self.config.latency_budget_ms {
            debug!(
                session = %state.session_id,
                latency_ms,
                budget_ms = self.config.latency_budget_ms,
                "Dispatch would exceed latency budget"
            );
            return Schedule::NoOp(NoOpReason::LatencyBudgetExceeded {
                latency_ms,
                budget_ms: self.config.latency_budget_ms,
            });
        }

        if break_applied {
            info!(
                session = %state.session_id,
                fatigue = level,
                break_ms = self.config.break_extension_ms,
                "Fatigue threshold reached, taking a break"
            );
            state.set_fatigue_level(0.0);
            state.consecutive_actions = 0;
            state.break_due = false;
        } else {
            let next = self.fatigue.after_action(level);
            state.set_fatigue_level(next);
            state.break_due = self.fatigue.needs_break(next);
            state.consecutive_actions = state.consecutive_actions.saturating_add(1);
        }

        Schedule::Plan(ActionPlan::new(
            state.session_id.clone(),
            candidate,
            Duration::from_millis(delay_ms),
            jitter_ms,
            break_applied,
        ))
    }

    /// Pause before the next observation, from the current fatigue.
    pub fn cooldown(&self, state: &SessionState) -> Duration {
        self.fatigue.cooldown(state.fatigue_level())
    }

    /// Let fatigue decay over an idle stretch.
    pub fn rest(&self, state: &mut SessionState, idle: Duration) {
        let level = self.fatigue.after_rest(state.fatigue_level(), idle);
        state.set_fatigue_level(level);
    }

    fn sample(&mut self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        match self.config.jitter {
            JitterKind::None => (min + max) / 2.0,
            JitterKind::Uniform => self.rng.random_range(min..=max),
            JitterKind::Triangular => {
                let a: f64 = self.rng.random_range(min..=max);
                let b: f64 = self.rng.random_range(min..=max);
                (a + b) / 2.0
            }
        }
    }
}
