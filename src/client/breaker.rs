use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-endpoint failure counter with a cooldown window.
///
/// Closed circuits pass every call. After `threshold` consecutive failures
/// the circuit opens and calls fail fast until `open_window` elapses; the
/// next call then runs as a half-open probe whose outcome either closes the
/// circuit again or re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: u32,
    last_failure_at: Option<Instant>,
    state: CircuitState,
    threshold: u32,
    open_window: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_window: Duration) -> Self {
        Self {
            failures: 0,
            last_failure_at: None,
            state: CircuitState::Closed,
            threshold: threshold.max(1),
            open_window,
        }
    }

    /// Gate one call. `Err` carries the remaining cooldown.
    pub fn check(&mut self) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.open_window);

                if elapsed >= self.open_window {
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.open_window - elapsed)
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_failure_at = None;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure_at = Some(Instant::now());

        if self.state == CircuitState::HalfOpen || self.failures >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn expired_window_permits_a_half_open_probe() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));

        breaker.record_failure();
        assert!(breaker.check().is_err());

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_the_circuit() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        breaker.check().unwrap();

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        breaker.check().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // One failure suffices in half-open, regardless of the threshold.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }
}
