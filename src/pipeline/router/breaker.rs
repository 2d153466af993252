//! Per-endpoint circuit breaker.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls rejected until the cooldown elapses.
    Open,
    /// One trial call allowed.
    HalfOpen,
}

/// What [`CircuitBreaker::try_acquire`] granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single HALF_OPEN trial call. Its outcome decides the next state.
    Probe,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    failure_threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Ask for permission to call. Moves OPEN to HALF_OPEN once the cooldown
    /// has elapsed; at most one probe is outstanding at a time.
    pub fn try_acquire(&mut self) -> Option<Permit> {
        if self.state == CircuitState::Open && self.cooldown_elapsed() {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
        }

        match self.state {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                Some(Permit::Probe)
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        }
    }

    pub fn record_success(&mut self, permit: Permit) {
        match (self.state, permit) {
            (CircuitState::Closed, _) => self.consecutive_failures = 0,
            (CircuitState::HalfOpen, Permit::Probe) => self.close(),
            // Late reports from calls granted before the circuit opened.
            _ => {}
        }
    }

    pub fn record_failure(&mut self, permit: Permit) {
        match (self.state, permit) {
            (CircuitState::Closed, _) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.open();
                }
            }
            (CircuitState::HalfOpen, Permit::Probe) => self.open(),
            _ => {}
        }
    }

    /// Current state, without triggering the cooldown transition.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    fn cooldown_elapsed(&self) -> bool {
        self.opened_at
            .map(|at| at.elapsed() >= self.cooldown)
            .unwrap_or(true)
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped(cooldown: Duration) -> CircuitBreaker {
        let mut cb = CircuitBreaker::new(3, cooldown);
        for _ in 0..3 {
            let permit = cb.try_acquire().unwrap();
            cb.record_failure(permit);
        }
        cb
    }

    #[test]
    fn opens_after_threshold() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure(Permit::Normal);
        cb.record_failure(Permit::Normal);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(Permit::Normal);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.opened_at().is_some());
        assert_eq!(cb.try_acquire(), None);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure(Permit::Normal);
        cb.record_failure(Permit::Normal);
        cb.record_success(Permit::Normal);
        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure(Permit::Normal);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let mut cb = tripped(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.try_acquire(), Some(Permit::Probe));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Second caller while the probe is outstanding.
        assert_eq!(cb.try_acquire(), None);
    }

    #[test]
    fn probe_success_closes() {
        let mut cb = tripped(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        let permit = cb.try_acquire().unwrap();
        cb.record_success(permit);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.try_acquire(), Some(Permit::Normal));
    }

    #[test]
    fn probe_failure_reopens_with_fresh_timestamp() {
        let mut cb = tripped(Duration::from_millis(10));
        let first_open = cb.opened_at().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let permit = cb.try_acquire().unwrap();
        cb.record_failure(permit);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.opened_at().unwrap() > first_open);
        assert_eq!(cb.try_acquire(), None);
    }

    #[test]
    fn late_reports_do_not_move_open_circuit() {
        let mut cb = tripped(Duration::from_secs(60));
        let opened = cb.opened_at();
        cb.record_failure(Permit::Normal);
        cb.record_success(Permit::Normal);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.opened_at(), opened);
    }

    #[test]
    fn non_probe_success_does_not_close_half_open() {
        let mut cb = tripped(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        let _probe = cb.try_acquire().unwrap();
        cb.record_success(Permit::Normal);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }
}
