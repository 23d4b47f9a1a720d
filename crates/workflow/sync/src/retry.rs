//! Bounded exponential backoff for transient backend errors

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry schedule
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay before the second attempt
    pub initial: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Random extra delay as a fraction of the computed delay
    pub jitter: f64,
    /// Total attempts, including the first
    pub steps: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.1,
            steps: 5,
            cap: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (0-based), before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 + extra)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// schedule is used up. The last error is returned.
pub async fn retry_transient<T, E, F, Fut>(
    backoff: &Backoff,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < steps => {
                let delay = backoff.jittered(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Transient error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
            steps: 4,
            cap: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let b = fast();
        assert_eq!(b.delay(0), Duration::from_millis(1));
        assert_eq!(b.delay(1), Duration::from_millis(2));
        assert_eq!(b.delay(10), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<u32, &str> = retry_transient(&fast(), |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("busy")
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_steps() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), &str> = retry_transient(&fast(), |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("busy")
        })
        .await;
        assert_eq!(result, Err("busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), &str> = retry_transient(&fast(), |_| false, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("missing")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
