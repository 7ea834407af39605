//! Pause and circuit-breaker state machine.
//!
//! Pure over explicit timestamps: callers pass `now`, nothing here reads a
//! clock or sleeps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BatchConfig;

/// Whether the scheduler may pull right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Gate {
    /// Pulling allowed.
    Open,
    /// Credentials are recovering.
    Paused {
        /// When pulling may resume.
        until: DateTime<Utc>,
    },
    /// Too many exhausted batches in a row.
    CircuitOpen {
        /// When the circuit closes.
        until: DateTime<Utc>,
    },
}

/// What a finished batch did to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Gate unchanged.
    None,
    /// Pulling paused.
    Paused {
        /// When pulling may resume.
        until: DateTime<Utc>,
    },
    /// Circuit opened.
    CircuitOpened {
        /// When the circuit closes.
        until: DateTime<Utc>,
    },
    /// A success closed an open circuit.
    CircuitClosed,
}

/// Per-batch input to the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSignal {
    /// Generations that succeeded.
    pub succeeded: usize,
    /// Whether any task found every credential exhausted.
    pub exhausted: bool,
    /// Longest retry hint reported by a provider.
    pub retry_after: Option<Duration>,
}

/// Pause deadline, circuit deadline and the consecutive-exhaustion counter.
#[derive(Debug, Clone)]
pub struct Backpressure {
    threshold: u32,
    pause: Duration,
    cooldown: Duration,
    pause_on_rate_limit: bool,
    consecutive_exhausted: u32,
    paused_until: Option<DateTime<Utc>>,
    circuit_until: Option<DateTime<Utc>>,
}

impl Backpressure {
    /// State machine configured from batch settings.
    pub const fn new(config: &BatchConfig) -> Self {
        Self {
            threshold: config.circuit_threshold,
            pause: config.rate_limit_pause(),
            cooldown: config.circuit_cooldown(),
            pause_on_rate_limit: config.pause_on_rate_limit,
            consecutive_exhausted: 0,
            paused_until: None,
            circuit_until: None,
        }
    }

    /// Consecutive exhausted batches so far.
    pub const fn consecutive_exhausted(&self) -> u32 {
        self.consecutive_exhausted
    }

    /// Gate at `now` without changing state.
    pub fn peek(&self, now: DateTime<Utc>) -> Gate {
        if let Some(until) = self.circuit_until.filter(|until| *until > now) {
            return Gate::CircuitOpen { until };
        }
        if let Some(until) = self.paused_until.filter(|until| *until > now) {
            return Gate::Paused { until };
        }
        Gate::Open
    }

    /// Gate at `now`, clearing deadlines that have passed.
    ///
    /// An elapsed circuit closes with its counter reset.
    pub fn check(&mut self, now: DateTime<Utc>) -> Gate {
        if self.circuit_until.is_some_and(|until| until <= now) {
            self.circuit_until = None;
            self.consecutive_exhausted = 0;
            info!("Circuit breaker cooldown elapsed, resuming");
        }
        if self.paused_until.is_some_and(|until| until <= now) {
            self.paused_until = None;
            info!("Rate limit pause elapsed, resuming");
        }
        self.peek(now)
    }

    /// Fold a finished batch into the state.
    ///
    /// Any success resets the counter and closes the circuit. A batch with no
    /// success that hit exhaustion counts toward the threshold; reaching it
    /// opens the circuit, which supersedes any pause.
    pub fn record_batch(&mut self, now: DateTime<Utc>, signal: BatchSignal) -> Transition {
        let mut transition = Transition::None;
        if signal.succeeded > 0 {
            self.consecutive_exhausted = 0;
            if self.circuit_until.take().is_some() {
                info!("Circuit breaker closed by successful generation");
                transition = Transition::CircuitClosed;
            }
        }
        if !signal.exhausted {
            return transition;
        }
        if signal.succeeded == 0 {
            self.consecutive_exhausted += 1;
        }

        if self.consecutive_exhausted >= self.threshold {
            let until = now + to_chrono(self.cooldown);
            self.circuit_until = Some(until);
            self.paused_until = None;
            warn!(
                consecutive = self.consecutive_exhausted,
                threshold = self.threshold,
                until = %until,
                "Circuit breaker opened"
            );
            return Transition::CircuitOpened { until };
        }

        if self.pause_on_rate_limit {
            let pause = signal.retry_after.map_or(self.pause, |hint| hint.max(self.pause));
            let until = now + to_chrono(pause);
            self.paused_until = Some(self.paused_until.map_or(until, |current| current.max(until)));
            warn!(
                consecutive = self.consecutive_exhausted,
                pause_secs = pause.as_secs(),
                "All credentials exhausted, pausing"
            );
            return Transition::Paused { until };
        }
        transition
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn machine() -> Backpressure {
        Backpressure::new(
            &BatchConfig::default().with_circuit(3, Duration::from_secs(300)),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn exhausted() -> BatchSignal {
        BatchSignal {
            succeeded: 0,
            exhausted: true,
            retry_after: None,
        }
    }

    #[test]
    fn exhaustion_pauses_until_deadline() {
        let mut bp = machine();
        let transition = bp.record_batch(t0(), exhausted());
        let until = t0() + chrono::Duration::seconds(70);
        assert_eq!(transition, Transition::Paused { until });
        assert_eq!(bp.check(t0() + chrono::Duration::seconds(69)), Gate::Paused { until });
        assert_eq!(bp.check(until), Gate::Open);
    }

    #[test]
    fn retry_after_hint_extends_pause() {
        let mut bp = machine();
        let signal = BatchSignal {
            retry_after: Some(Duration::from_secs(120)),
            ..exhausted()
        };
        let transition = bp.record_batch(t0(), signal);
        assert_eq!(
            transition,
            Transition::Paused {
                until: t0() + chrono::Duration::seconds(120)
            }
        );
    }

    #[test]
    fn threshold_opens_circuit_over_pause() {
        let mut bp = machine();
        bp.record_batch(t0(), exhausted());
        bp.record_batch(t0(), exhausted());
        let transition = bp.record_batch(t0(), exhausted());
        let until = t0() + chrono::Duration::seconds(300);
        assert_eq!(transition, Transition::CircuitOpened { until });
        assert_eq!(bp.check(t0() + chrono::Duration::seconds(100)), Gate::CircuitOpen { until });
        assert_eq!(bp.check(until), Gate::Open);
        assert_eq!(bp.consecutive_exhausted(), 0);
    }

    #[test]
    fn success_resets_counter() {
        let mut bp = machine();
        bp.record_batch(t0(), exhausted());
        bp.record_batch(t0(), exhausted());
        bp.record_batch(
            t0(),
            BatchSignal {
                succeeded: 1,
                ..BatchSignal::default()
            },
        );
        assert_eq!(bp.consecutive_exhausted(), 0);
        assert!(matches!(bp.record_batch(t0(), exhausted()), Transition::Paused { .. }));
    }

    #[test]
    fn success_closes_open_circuit() {
        let mut bp = machine();
        for _ in 0..3 {
            bp.record_batch(t0(), exhausted());
        }
        let transition = bp.record_batch(
            t0(),
            BatchSignal {
                succeeded: 2,
                ..BatchSignal::default()
            },
        );
        assert_eq!(transition, Transition::CircuitClosed);
        assert_eq!(bp.peek(t0()), Gate::Open);
    }

    #[test]
    fn pause_can_be_disabled() {
        let mut config = BatchConfig::default();
        config.pause_on_rate_limit = false;
        let mut bp = Backpressure::new(&config);
        assert_eq!(bp.record_batch(t0(), exhausted()), Transition::None);
        assert_eq!(bp.check(t0()), Gate::Open);
    }
}
