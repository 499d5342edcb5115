use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Uniform random pause before every keyword and page transition.
///
/// Pure jitter: the window never widens after errors.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_delay: Duration,
}

impl RateLimiter {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    /// A limiter that never waits. Used by tests.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Draws a delay in `[0, max_delay)`.
    pub fn next_delay(&self) -> Duration {
        let max_ms = self.max_delay.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::thread_rng().gen_range(0..max_ms);
        Duration::from_millis(ms)
    }

    pub async fn pause(&self, before: &str) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }
        tracing::info!("⏳ Waiting {:.2}s before {}", delay.as_secs_f64(), before);
        sleep(delay).await;
    }
}
