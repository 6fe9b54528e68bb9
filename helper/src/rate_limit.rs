//! Per-client rate limiting.
//!
//! Two independent limiters share the same shape (a window keyed by client
//! identity): one tracks authentication attempts before a session exists and
//! decides when a brute-forcing client gets disconnected, the other throttles
//! request frequency for authenticated sessions.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sliding window over authentication attempts.
pub const AUTH_WINDOW: Duration = Duration::from_secs(10);
/// Attempts admitted per window and client.
pub const MAX_AUTH_ATTEMPTS_PER_WINDOW: u32 = 5;
/// Consecutive failures after which the connection is terminated.
pub const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 5;

/// Fixed window over authenticated requests.
pub const REQUEST_WINDOW: Duration = Duration::from_secs(60);
/// Requests admitted per window and session.
pub const MAX_REQUESTS_PER_WINDOW: u32 = 120;

#[derive(Default)]
struct AuthState {
    attempts:             VecDeque<Instant>,
    consecutive_failures: u32,
}

/// Pre-authentication limiter, keyed by the transport-level identity of a
/// connection that has not proven anything yet.
pub struct AuthLimiter {
    window:       Duration,
    max_attempts: u32,
    max_failures: u32,
    table:        Mutex<HashMap<String, AuthState>>,
}

impl AuthLimiter {
    pub fn new() -> Self {
        Self::with_limits(
            AUTH_WINDOW,
            MAX_AUTH_ATTEMPTS_PER_WINDOW,
            MAX_CONSECUTIVE_AUTH_FAILURES,
        )
    }

    pub fn with_limits(window: Duration, max_attempts: u32, max_failures: u32) -> Self {
        Self {
            window,
            max_attempts,
            max_failures,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or throttles one authentication attempt.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut table = self.table.lock();
        let state = table.entry(key.to_string()).or_default();

        while let Some(oldest) = state.attempts.front() {
            if now.duration_since(*oldest) >= self.window {
                state.attempts.pop_front();
            } else {
                break;
            }
        }

        if state.attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        state.attempts.push_back(now);
        true
    }

    /// Records a failed attempt. Returns `true` when the consecutive-failure
    /// threshold is reached and the caller must terminate the connection.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut table = self.table.lock();
        let state = table.entry(key.to_string()).or_default();
        state.consecutive_failures += 1;
        state.consecutive_failures >= self.max_failures
    }

    /// A successful authentication clears the failure streak.
    pub fn record_success(&self, key: &str) {
        if let Some(state) = self.table.lock().get_mut(key) {
            state.consecutive_failures = 0;
        }
    }

    /// Releases a client's state on disconnect. Idempotent.
    pub fn remove(&self, key: &str) {
        self.table.lock().remove(key);
    }
}

impl Default for AuthLimiter {
    fn default() -> Self {
        Self::new()
    }
}

struct RequestState {
    window_start: Instant,
    count:        u32,
}

/// Post-authentication limiter, keyed by session id.
pub struct RequestLimiter {
    window:       Duration,
    max_requests: u32,
    table:        Mutex<HashMap<String, RequestState>>,
}

impl RequestLimiter {
    pub fn new() -> Self {
        Self::with_limits(REQUEST_WINDOW, MAX_REQUESTS_PER_WINDOW)
    }

    pub fn with_limits(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Admits one request, or reports that the session's quota for the
    /// current window is spent.
    pub fn try_acquire(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut table = self.table.lock();
        let state = table
            .entry(session_id.to_string())
            .or_insert_with(|| RequestState {
                window_start: now,
                count:        0,
            });

        if now.duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count >= self.max_requests {
            return false;
        }
        state.count += 1;
        true
    }

    /// Releases a session's state. Idempotent.
    pub fn remove(&self, session_id: &str) {
        self.table.lock().remove(session_id);
    }
}

impl Default for RequestLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_attempts_throttled_within_window() {
        let limiter = AuthLimiter::with_limits(Duration::from_secs(60), 3, 5);
        assert!(limiter.try_acquire("client"));
        assert!(limiter.try_acquire("client"));
        assert!(limiter.try_acquire("client"));
        assert!(!limiter.try_acquire("client"));
        // Another client is unaffected.
        assert!(limiter.try_acquire("other"));
    }

    #[test]
    fn auth_window_slides() {
        let limiter = AuthLimiter::with_limits(Duration::from_millis(10), 1, 5);
        assert!(limiter.try_acquire("client"));
        assert!(!limiter.try_acquire("client"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.try_acquire("client"));
    }

    #[test]
    fn disconnect_on_nth_failure_not_before() {
        let limiter = AuthLimiter::with_limits(Duration::from_secs(60), 100, 5);
        for _ in 0..4 {
            assert!(!limiter.record_failure("client"));
        }
        assert!(limiter.record_failure("client"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let limiter = AuthLimiter::with_limits(Duration::from_secs(60), 100, 5);
        for _ in 0..4 {
            limiter.record_failure("client");
        }
        limiter.record_success("client");
        for _ in 0..4 {
            assert!(!limiter.record_failure("client"));
        }
        assert!(limiter.record_failure("client"));
    }

    #[test]
    fn auth_remove_is_idempotent() {
        let limiter = AuthLimiter::new();
        limiter.try_acquire("client");
        limiter.remove("client");
        limiter.remove("client");
        limiter.remove("never-seen");
    }

    #[test]
    fn request_quota_rejects_only_the_excess() {
        let limiter = RequestLimiter::with_limits(Duration::from_secs(60), 3);
        assert!(limiter.try_acquire("session"));
        assert!(limiter.try_acquire("session"));
        assert!(limiter.try_acquire("session"));
        assert!(!limiter.try_acquire("session"));
        assert!(!limiter.try_acquire("session"));
        // Other sessions keep their own quota.
        assert!(limiter.try_acquire("other"));
    }

    #[test]
    fn request_window_resets() {
        let limiter = RequestLimiter::with_limits(Duration::from_millis(10), 2);
        assert!(limiter.try_acquire("session"));
        assert!(limiter.try_acquire("session"));
        assert!(!limiter.try_acquire("session"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.try_acquire("session"));
    }

    #[test]
    fn request_remove_is_idempotent() {
        let limiter = RequestLimiter::new();
        limiter.try_acquire("session");
        limiter.remove("session");
        limiter.remove("session");
    }
}
