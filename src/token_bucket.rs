use std::time::{Duration, Instant};

/// Per-client limiter state.
///
/// Refill rate and burst capacity are process-wide, so they are passed in on
/// every call rather than stored per client.
#[derive(Debug, Clone)]
pub struct ClientState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl ClientState {
    /// A first-seen client starts with a full bucket.
    pub fn new(now: Instant, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Refill, then try to take one token.
    pub fn admit(&mut self, now: Instant, refill_rate: f64, burst: u32) -> bool {
        self.refill(now, refill_rate, burst);
        if now > self.last_seen {
            self.last_seen = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Token count as of `now`, without consuming or counting as activity.
    pub fn available(&self, now: Instant, refill_rate: f64, burst: u32) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * refill_rate).min(burst as f64)
    }

    /// Whole tokens currently held.
    pub fn remaining(&self) -> u32 {
        self.tokens.floor() as u32
    }

    /// Time until one whole token is available, or `None` if one already is.
    pub fn retry_after(&self, refill_rate: f64) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return None;
        }

        let tokens_needed = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(tokens_needed / refill_rate))
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// True when the client has not been checked for longer than `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > idle_timeout
    }

    fn refill(&mut self, now: Instant, refill_rate: f64, burst: u32) {
        // A reading older than last_refill adds nothing and never rewinds the clock.
        if now <= self.last_refill {
            return;
        }

        let elapsed = now.duration_since(self.last_refill);
        let tokens_to_add = refill_rate * elapsed.as_secs_f64();

        self.tokens = (self.tokens + tokens_to_add).min(burst as f64);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_client_starts_full() {
        let now = Instant::now();
        let state = ClientState::new(now, 20);
        assert_eq!(state.remaining(), 20);
        assert_eq!(state.retry_after(10.0), None);
    }

    #[test]
    fn test_burst_then_deny() {
        let now = Instant::now();
        let mut state = ClientState::new(now, 5);

        for _ in 0..5 {
            assert!(state.admit(now, 1.0, 5));
        }
        assert!(!state.admit(now, 1.0, 5));
        assert_eq!(state.remaining(), 0);
    }

    #[test]
    fn test_fractional_tokens_persist() {
        let start = Instant::now();
        let mut state = ClientState::new(start, 1);
        assert!(state.admit(start, 2.0, 1));

        // 0.25s at 2/s is half a token: not enough, but it must not be lost.
        let t1 = start + Duration::from_millis(250);
        assert!(!state.admit(t1, 2.0, 1));

        let t2 = start + Duration::from_millis(500);
        assert!(state.admit(t2, 2.0, 1));
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let start = Instant::now();
        let mut state = ClientState::new(start, 5);
        for _ in 0..3 {
            state.admit(start, 1000.0, 5);
        }

        let later = start + Duration::from_secs(60);
        assert_eq!(state.available(later, 1000.0, 5), 5.0);
        assert!(state.admit(later, 1000.0, 5));
        assert_eq!(state.remaining(), 4);
    }

    #[test]
    fn test_clock_never_moves_backward() {
        let start = Instant::now();
        let later = start + Duration::from_secs(1);
        let mut state = ClientState::new(later, 2);

        assert!(state.admit(later, 1.0, 2));
        // An older reading refills nothing and keeps last_seen at the newer time.
        assert!(state.admit(start, 1.0, 2));
        assert!(!state.admit(start, 1.0, 2));
        assert_eq!(state.last_seen(), later);
    }

    #[test]
    fn test_retry_after() {
        let now = Instant::now();
        let mut state = ClientState::new(now, 1);
        assert!(state.admit(now, 4.0, 1));

        let wait = state.retry_after(4.0).unwrap();
        assert_eq!(wait, Duration::from_millis(250));
    }

    #[test]
    fn test_idle_detection() {
        let now = Instant::now();
        let state = ClientState::new(now, 1);
        let idle = Duration::from_secs(180);

        assert!(!state.is_idle(now + Duration::from_secs(180), idle));
        assert!(state.is_idle(now + Duration::from_secs(181), idle));
    }
}
