//! Rate limiting shared by every worker of a collection run

use crate::config::RateLimitConfig;
use crate::error::{IngestError, Result};
use governor::{clock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter as GovernorRateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::trace;

/// Token bucket admitting at most `requests_per_interval` requests in any window
/// of one interval, however many workers draw from it.
///
/// Permits are spread evenly (one every `interval / requests`) instead of being
/// handed out as a burst, which is what keeps the per-window bound strict.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<GovernorRateLimiter<NotKeyed, InMemoryState, clock::DefaultClock>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let requests = NonZeroU32::new(config.requests_per_interval).ok_or_else(|| {
            IngestError::Config("requests_per_interval must be > 0".to_string())
        })?;

        let period = config.interval() / requests.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                IngestError::Config(format!(
                    "rate limit of {} per {:?} is too fine-grained",
                    requests,
                    config.interval()
                ))
            })?
            .allow_burst(NonZeroU32::MIN);

        Ok(Self {
            limiter: Arc::new(GovernorRateLimiter::direct(quota)),
        })
    }

    /// Wait until rate limit allows the request
    pub async fn acquire(&self) {
        loop {
            match self.limiter.check() {
                Ok(_) => return,
                Err(not_until) => {
                    let wait = not_until
                        .wait_time_from(clock::Clock::now(&clock::DefaultClock::default()));
                    trace!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Try to acquire without waiting
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
