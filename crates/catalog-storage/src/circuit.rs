//! Per-source circuit breaker: `closed -> open -> half_open -> closed`.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker fails fast before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_started: Option<Instant> },
}

/// Outcome of asking the breaker for permission to call the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Probe,
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed {
                consecutive_failures: 0,
            },
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        let cooldown = self.config.cooldown;
        match self.state {
            BreakerState::Closed { .. } => Admission::Allowed,
            BreakerState::Open { opened_at } => {
                let reopen_at = opened_at + cooldown;
                if now >= reopen_at {
                    self.state = BreakerState::HalfOpen {
                        probe_started: Some(now),
                    };
                    Admission::Probe
                } else {
                    Admission::Rejected {
                        retry_after: reopen_at - now,
                    }
                }
            }
            // A probe that never reported back expires after one cooldown.
            BreakerState::HalfOpen {
                probe_started: Some(started),
            } if now < started + cooldown => Admission::Rejected {
                retry_after: started + cooldown - now,
            },
            BreakerState::HalfOpen { .. } => {
                self.state = BreakerState::HalfOpen {
                    probe_started: Some(now),
                };
                Admission::Probe
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.state = match self.state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= self.config.failure_threshold.max(1) {
                    BreakerState::Open { opened_at: now }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            BreakerState::HalfOpen { .. } => BreakerState::Open { opened_at: now },
            open @ BreakerState::Open { .. } => open,
        };
    }

    /// Frees a half-open probe slot without judging the source healthy or degraded.
    pub fn release_probe(&mut self) {
        if let BreakerState::HalfOpen { .. } = self.state {
            self.state = BreakerState::HalfOpen {
                probe_started: None,
            };
        }
    }
}
