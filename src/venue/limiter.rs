//! Per-venue request pacing.
//!
//! Each venue carries two limiters (one for public market-data endpoints,
//! one for authenticated trading endpoints) enforcing a minimum spacing
//! between calls within a rolling window. Every adapter call awaits its
//! limiter before issuing the request.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug)]
struct LimiterState {
    current_requests: u32,
    window_start: Instant,
    last_call: Option<Instant>,
}

#[derive(Debug)]
pub struct PaceLimiter {
    requests_per_window: u32,
    window: Duration,
    /// Minimum spacing between consecutive calls.
    min_gap: Duration,
    state: Mutex<LimiterState>,
}

impl PaceLimiter {
    pub fn new(requests_per_window: u32, window: Duration, min_gap: Duration) -> Self {
        Self {
            requests_per_window,
            window,
            min_gap,
            state: Mutex::new(LimiterState {
                current_requests: 0,
                window_start: Instant::now(),
                last_call: None,
            }),
        }
    }

    /// Wait until the next call is allowed, then account for it.
    pub async fn acquire(&self) {
        let mut st = self.state.lock().await;

        if let Some(last) = st.last_call {
            let since = last.elapsed();
            if since < self.min_gap {
                sleep(self.min_gap - since).await;
            }
        }

        if st.window_start.elapsed() >= self.window {
            st.current_requests = 0;
            st.window_start = Instant::now();
        }

        if st.current_requests >= self.requests_per_window {
            let wait = self.window.saturating_sub(st.window_start.elapsed());
            if wait > Duration::ZERO {
                debug!("rate limiting: waiting {}ms", wait.as_millis());
                sleep(wait).await;
            }
            st.current_requests = 0;
            st.window_start = Instant::now();
        }

        st.current_requests += 1;
        st.last_call = Some(Instant::now());
    }
}

/// The public/authenticated limiter pair one venue carries.
#[derive(Debug)]
pub struct VenueLimiters {
    pub public: PaceLimiter,
    pub auth: PaceLimiter,
}

impl VenueLimiters {
    pub fn new_default() -> Self {
        Self {
            // Public data endpoints tolerate bursts; trading calls are paced harder.
            public: PaceLimiter::new(400, Duration::from_secs(10), Duration::from_millis(10)),
            auth: PaceLimiter::new(40, Duration::from_secs(10), Duration::from_millis(100)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_min_gap_enforced() {
        let l = PaceLimiter::new(100, Duration::from_secs(10), Duration::from_millis(30));
        let start = Instant::now();
        l.acquire().await;
        l.acquire().await;
        l.acquire().await;
        // Two gaps of ≥30ms between three calls.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_window_quota_blocks() {
        let l = PaceLimiter::new(2, Duration::from_millis(100), Duration::ZERO);
        let start = Instant::now();
        l.acquire().await;
        l.acquire().await;
        l.acquire().await; // third call must wait for the window to roll
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
