//! Token-bucket rate limiting for adapter network clients.
//!
//! A data source declares its limit in its descriptor; adapters obtain
//! the account's shared limiter and await [`RateLimiter::acquire`]
//! around each request. Tokens refill at `requests_per_hour` with a
//! configured burst. The refill task is owned by the archive and stopped
//! on close.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A data source's declared rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub requests_per_hour: u32,
    pub burst: u32,
}

/// A shared token bucket enforcing a [`RateLimit`].
pub struct RateLimiter {
    tokens: tokio::sync::Mutex<mpsc::Receiver<()>>,
    refill: JoinHandle<()>,
}

impl RateLimiter {
    /// Start a limiter and its refill task. The bucket begins full.
    pub fn start(limit: RateLimit) -> Self {
        let burst = limit.burst.max(1) as usize;
        let (tx, rx) = mpsc::channel(burst);
        for _ in 0..burst {
            // Channel capacity equals burst, so this cannot fail.
            let _ = tx.try_send(());
        }

        let interval = refill_interval(limit.requests_per_hour);
        let refill = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        RateLimiter {
            tokens: tokio::sync::Mutex::new(rx),
            refill,
        }
    }

    /// Wait until a request token is available.
    pub async fn acquire(&self) {
        let mut tokens = self.tokens.lock().await;
        if tokens.recv().await.is_none() {
            // Refill task stopped; the archive is closing. Let the
            // request proceed so shutdown is not wedged on a limiter.
            debug!("Rate limiter drained after shutdown; letting request through");
        }
    }

    /// Stop the refill task.
    pub fn stop(&self) {
        self.refill.abort();
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.refill.abort();
    }
}

fn refill_interval(requests_per_hour: u32) -> Duration {
    if requests_per_hour == 0 {
        // No declared rate; refill fast enough to be a no-op.
        return Duration::from_millis(1);
    }
    Duration::from_secs_f64(3600.0 / f64::from(requests_per_hour))
}
