use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RiskError;

/// Persisted form of the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub consecutive_losses: u32,
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub cooldown_secs: i64,
    #[serde(default)]
    pub total_trips: u64,
}

impl CircuitBreakerState {
    pub fn cooldown_duration(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }
}

/// Consecutive-loss breaker: halts new entries after `threshold` losing
/// closes in a row, until `cooldown` has elapsed.
///
/// Open positions keep being supervised and may close while tripped; those
/// closes are still recorded but do not extend the cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Result<Self, RiskError> {
        if threshold == 0 {
            return Err(RiskError::Config("breaker threshold must be at least 1".into()));
        }
        if cooldown < Duration::zero() {
            return Err(RiskError::Config("breaker cooldown cannot be negative".into()));
        }
        Ok(Self {
            state: CircuitBreakerState {
                consecutive_losses: 0,
                active: false,
                activated_at: None,
                threshold,
                cooldown_secs: cooldown.num_seconds(),
                total_trips: 0,
            },
        })
    }

    pub fn from_state(state: CircuitBreakerState) -> Result<Self, RiskError> {
        let mut breaker = Self::new(state.threshold, state.cooldown_duration())?;
        breaker.state = state;
        Ok(breaker)
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    /// Change threshold/cooldown without losing the current streak.
    pub fn reconfigure(&mut self, threshold: u32, cooldown: Duration) -> Result<(), RiskError> {
        let fresh = Self::new(threshold, cooldown)?;
        self.state.threshold = fresh.state.threshold;
        self.state.cooldown_secs = fresh.state.cooldown_secs;
        Ok(())
    }

    pub fn record(&mut self, profitable: bool) -> bool {
        self.record_at(profitable, Utc::now())
    }

    /// Record one closed trade. Returns true when this call tripped the
    /// breaker.
    pub fn record_at(&mut self, profitable: bool, now: DateTime<Utc>) -> bool {
        // An elapsed cooldown clears first, so this close counts toward a
        // fresh streak.
        self.is_tripped_at(now);

        if profitable {
            self.state.consecutive_losses = 0;
            return false;
        }

        self.state.consecutive_losses = self.state.consecutive_losses.saturating_add(1);
        if self.state.active || self.state.consecutive_losses < self.state.threshold {
            return false;
        }

        self.state.active = true;
        self.state.activated_at = Some(now);
        self.state.total_trips += 1;
        tracing::warn!(
            "Circuit breaker tripped after {} consecutive losses, cooling down for {}s",
            self.state.consecutive_losses,
            self.state.cooldown_secs
        );
        true
    }

    pub fn is_tripped(&mut self) -> bool {
        self.is_tripped_at(Utc::now())
    }

    /// True while the cooldown is running. Clears the breaker, and the loss
    /// streak, once it has elapsed.
    pub fn is_tripped_at(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.active {
            return false;
        }
        let activated_at = match self.state.activated_at {
            Some(at) => at,
            None => {
                // Active without a timestamp cannot expire; restart the clock.
                self.state.activated_at = Some(now);
                return true;
            }
        };

        if now - activated_at < self.state.cooldown_duration() {
            return true;
        }

        tracing::info!("Circuit breaker cooldown elapsed, resuming entries");
        self.state.active = false;
        self.state.activated_at = None;
        self.state.consecutive_losses = 0;
        false
    }

    pub fn remaining_cooldown_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let activated_at = self.state.activated_at.filter(|_| self.state.active)?;
        let remaining = self.state.cooldown_duration() - (now - activated_at);
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// Operator override.
    pub fn reset(&mut self) {
        self.state.active = false;
        self.state.activated_at = None;
        self.state.consecutive_losses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::minutes(30)).unwrap()
    }

    #[test]
    fn test_trips_at_threshold() {
        let mut cb = breaker();
        assert!(!cb.record_at(false, t0()));
        assert!(!cb.record_at(false, t0()));
        assert!(!cb.is_tripped_at(t0()));
        assert!(cb.record_at(false, t0()));
        assert!(cb.is_tripped_at(t0()));
        assert_eq!(cb.state().activated_at, Some(t0()));
        assert_eq!(cb.state().total_trips, 1);
    }

    #[test]
    fn test_profit_resets_streak() {
        let mut cb = breaker();
        cb.record_at(false, t0());
        cb.record_at(false, t0());
        cb.record_at(true, t0());
        assert_eq!(cb.state().consecutive_losses, 0);
        cb.record_at(false, t0());
        assert!(!cb.is_tripped_at(t0()));
    }

    #[test]
    fn test_cooldown_boundary() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_at(false, t0());
        }
        let almost = t0() + Duration::minutes(30) - Duration::seconds(1);
        assert!(cb.is_tripped_at(almost));
        assert_eq!(cb.remaining_cooldown_at(almost), Some(Duration::seconds(1)));

        // Exactly at cooldown the breaker clears.
        assert!(!cb.is_tripped_at(t0() + Duration::minutes(30)));
        assert_eq!(cb.state().consecutive_losses, 0);
        assert!(!cb.state().active);
    }

    #[test]
    fn test_losses_while_tripped_do_not_extend() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_at(false, t0());
        }
        assert!(!cb.record_at(false, t0() + Duration::minutes(10)));
        assert_eq!(cb.state().activated_at, Some(t0()));
        assert!(!cb.is_tripped_at(t0() + Duration::minutes(30)));
    }

    #[test]
    fn test_losses_after_cooldown_start_new_streak() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_at(false, t0());
        }

        // Nobody asked is_tripped between the cooldown ending and these closes.
        let later = t0() + Duration::hours(2);
        assert!(!cb.record_at(false, later));
        assert_eq!(cb.state().consecutive_losses, 1);
        assert!(!cb.record_at(false, later));
        assert!(cb.record_at(false, later));

        assert!(cb.is_tripped_at(later + Duration::minutes(1)));
        assert_eq!(cb.state().activated_at, Some(later));
        assert_eq!(cb.state().consecutive_losses, 3);
        assert_eq!(cb.state().total_trips, 2);
    }

    #[test]
    fn test_state_round_trip() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_at(false, t0());
        }
        let json = serde_json::to_string(cb.state()).unwrap();
        let state: CircuitBreakerState = serde_json::from_str(&json).unwrap();
        let mut restored = CircuitBreaker::from_state(state).unwrap();
        assert!(restored.is_tripped_at(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_invalid_config() {
        assert!(CircuitBreaker::new(0, Duration::minutes(1)).is_err());
        assert!(CircuitBreaker::new(1, Duration::minutes(-1)).is_err());
    }
}
