//! FIFO minimum-interval gate for outbound upstream calls.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Serializes callers so that no two `wait()` calls release less than
/// `min_interval` apart. Waiters are served in arrival order because the
/// underlying `tokio::sync::Mutex` queues lock acquisitions FIFO.
///
/// Quota sweeps and project-id repair intentionally bypass this gate — they
/// are meant to be aggressive and parallel.
pub struct RateLimiter {
    min_interval: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::from_millis(min_interval_ms),
            last_release: Mutex::new(None),
        }
    }

    /// The default `v1internal` limiter spaces requests 1000ms apart.
    pub fn default_v1internal() -> Self {
        Self::new(1000)
    }

    /// Suspend until at least `min_interval` has elapsed since the previous
    /// `wait()` returned.
    pub async fn wait(&self) {
        let mut last = self.last_release.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn serializes_waiters_with_minimum_spacing() {
        let limiter = Arc::new(RateLimiter::new(100));
        let start = Instant::now();

        limiter.wait().await;
        let first = start.elapsed();

        limiter.wait().await;
        let second = start.elapsed();

        assert!(first < Duration::from_millis(100));
        assert!(second >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_are_spaced_out() {
        let limiter = Arc::new(RateLimiter::new(50));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait().await;
                Instant::now()
            }));
        }

        let mut releases = Vec::new();
        for h in handles {
            releases.push(h.await.unwrap());
        }
        releases.sort();

        for pair in releases.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(50));
        }
    }
}
