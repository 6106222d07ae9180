//! Bounded polling shared by the readiness probe and the job controller.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Result of a single attempt.
#[derive(Debug, PartialEq)]
pub enum Attempt<T> {
    Pending,
    Done(T),
}

/// Result of the whole loop.
#[derive(Debug, PartialEq)]
pub enum Polled<T> {
    Ready(T),
    TimedOut { attempts: u32 },
}

/// Call `attempt` up to `policy.max_attempts` times, sleeping `policy.interval`
/// between calls, until it reports `Done`. An `Err` from `attempt` stops the
/// loop immediately. No call is made after the last attempt.
pub async fn poll_bounded<T, E, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<Polled<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    for n in 1..=policy.max_attempts {
        if let Attempt::Done(value) = attempt(n).await? {
            return Ok(Polled::Ready(value));
        }
        if n < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Ok(Polled::TimedOut { attempts: policy.max_attempts })
}
