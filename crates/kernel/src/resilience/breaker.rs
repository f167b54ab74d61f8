//! Circuit breaker state machine.
//!
//! Snapshots are plain values; the controller persists every transition with
//! a compare-and-set so all nodes agree on one breaker per dependency.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds driving the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
}

/// Shared breaker state for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub window_started_at_ms: u64,
    pub last_failure_at_ms: Option<u64>,
    pub opened_at_ms: Option<u64>,
    pub probe_started_at_ms: Option<u64>,
    /// Bumped on every persisted change.
    pub version: u64,
}

/// Breaker decision for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Admit as the single half-open probe once `next` is persisted.
    Probe(BreakerSnapshot),
    Reject { retry_after_ms: u64 },
}

impl BreakerSnapshot {
    fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Decide whether a call may proceed at `now_ms`.
    pub fn admit(&self, policy: &BreakerPolicy, now_ms: u64) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => {
                let reopen_at = self
                    .opened_at_ms
                    .unwrap_or(0)
                    .saturating_add(policy.cooldown_ms);
                if now_ms >= reopen_at {
                    Admission::Probe(self.start_probe(now_ms))
                } else {
                    Admission::Reject {
                        retry_after_ms: reopen_at - now_ms,
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported is superseded after a cooldown.
                let superseded_at = self
                    .probe_started_at_ms
                    .unwrap_or(0)
                    .saturating_add(policy.cooldown_ms);
                if now_ms >= superseded_at {
                    Admission::Probe(self.start_probe(now_ms))
                } else {
                    Admission::Reject {
                        retry_after_ms: superseded_at - now_ms,
                    }
                }
            }
        }
    }

    fn start_probe(&self, now_ms: u64) -> Self {
        Self {
            state: CircuitState::HalfOpen,
            probe_started_at_ms: Some(now_ms),
            ..self.next()
        }
    }

    /// Snapshot after a successful call, if anything changes.
    pub fn on_success(&self, probe: bool) -> Option<Self> {
        match self.state {
            CircuitState::Closed if self.failures > 0 => Some(Self {
                failures: 0,
                ..self.next()
            }),
            CircuitState::HalfOpen if probe => Some(Self {
                state: CircuitState::Closed,
                failures: 0,
                opened_at_ms: None,
                probe_started_at_ms: None,
                ..self.next()
            }),
            _ => None,
        }
    }

    /// Snapshot after a failed call, if anything changes.
    pub fn on_failure(&self, policy: &BreakerPolicy, now_ms: u64, probe: bool) -> Option<Self> {
        match self.state {
            CircuitState::Closed => {
                let window_expired =
                    now_ms.saturating_sub(self.window_started_at_ms) >= policy.failure_window_ms;
                let (failures, window_started_at_ms) = if self.failures == 0 || window_expired {
                    (1, now_ms)
                } else {
                    (self.failures + 1, self.window_started_at_ms)
                };
                let mut next = Self {
                    failures,
                    window_started_at_ms,
                    last_failure_at_ms: Some(now_ms),
                    ..self.next()
                };
                if failures >= policy.failure_threshold {
                    next.state = CircuitState::Open;
                    next.opened_at_ms = Some(now_ms);
                }
                Some(next)
            }
            CircuitState::HalfOpen if probe => Some(Self {
                state: CircuitState::Open,
                opened_at_ms: Some(now_ms),
                probe_started_at_ms: None,
                last_failure_at_ms: Some(now_ms),
                ..self.next()
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const POLICY: BreakerPolicy = BreakerPolicy {
        failure_threshold: 3,
        failure_window_ms: 10_000,
        cooldown_ms: 5_000,
    };

    fn fail_n(mut snap: BreakerSnapshot, n: u32, now: u64) -> BreakerSnapshot {
        for _ in 0..n {
            snap = snap.on_failure(&POLICY, now, false).unwrap();
        }
        snap
    }

    #[test]
    fn test_opens_at_threshold() {
        let snap = fail_n(BreakerSnapshot::default(), 2, 100);
        assert_eq!(snap.state, CircuitState::Closed);
        let snap = fail_n(snap, 1, 100);
        assert_eq!(snap.state, CircuitState::Open);
        assert_eq!(snap.opened_at_ms, Some(100));
        assert_eq!(snap.version, 3);
    }

    #[test]
    fn test_success_resets_count() {
        let snap = fail_n(BreakerSnapshot::default(), 2, 100);
        let snap = snap.on_success(false).unwrap();
        assert_eq!(snap.failures, 0);
        assert!(snap.on_success(false).is_none());
    }

    #[test]
    fn test_failures_outside_window_restart_count() {
        let snap = fail_n(BreakerSnapshot::default(), 2, 0);
        let snap = snap.on_failure(&POLICY, 10_000, false).unwrap();
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let open = fail_n(BreakerSnapshot::default(), 3, 1_000);
        assert_eq!(
            open.admit(&POLICY, 2_000),
            Admission::Reject {
                retry_after_ms: 4_000
            }
        );
        let Admission::Probe(half) = open.admit(&POLICY, 6_000) else {
            panic!("expected a probe");
        };
        assert_eq!(half.state, CircuitState::HalfOpen);
        // Only one probe while it is outstanding.
        assert!(matches!(half.admit(&POLICY, 6_001), Admission::Reject { .. }));
    }

    #[test]
    fn test_probe_outcomes() {
        let open = fail_n(BreakerSnapshot::default(), 3, 0);
        let Admission::Probe(half) = open.admit(&POLICY, 5_000) else {
            panic!("expected a probe");
        };
        assert_eq!(half.on_success(true).unwrap().state, CircuitState::Closed);
        let reopened = half.on_failure(&POLICY, 5_100, true).unwrap();
        assert_eq!(reopened.state, CircuitState::Open);
        assert_eq!(reopened.opened_at_ms, Some(5_100));
        // Non-probe results do not move a half-open breaker.
        assert!(half.on_success(false).is_none());
        assert!(half.on_failure(&POLICY, 5_100, false).is_none());
    }

    #[test]
    fn test_stale_probe_is_superseded() {
        let open = fail_n(BreakerSnapshot::default(), 3, 0);
        let Admission::Probe(half) = open.admit(&POLICY, 5_000) else {
            panic!("expected a probe");
        };
        assert!(matches!(half.admit(&POLICY, 10_000), Admission::Probe(_)));
    }
}
