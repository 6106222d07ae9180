use tracing::{debug, info, warn};

use crate::engine::EngineApi;
use crate::retry::{poll_bounded, Attempt, Polled, RetryPolicy};

/// Wait until the engine both answers HTTP and accepts graphs.
///
/// The engine's socket opens before its nodes and models finish loading, so
/// liveness is checked first and then the prompt endpoint is probed with an
/// empty graph. Each tier gets its own `policy` budget. Returns `false` when
/// either tier runs out; the caller decides what that means.
pub async fn await_ready<E: EngineApi + ?Sized>(engine: &E, policy: RetryPolicy) -> bool {
    let alive = poll_bounded(policy, |attempt| async move {
        match engine.check_alive().await {
            Ok(()) => Ok::<_, std::convert::Infallible>(Attempt::Done(())),
            Err(e) => {
                debug!(attempt, error = %e, "engine not reachable yet");
                Ok(Attempt::Pending)
            }
        }
    })
    .await;
    if let Ok(Polled::TimedOut { attempts }) = alive {
        warn!(attempts, "engine did not answer liveness checks");
        return false;
    }

    let functional = poll_bounded(policy, |attempt| async move {
        match engine.probe_prompt_endpoint().await {
            Ok(true) => Ok::<_, std::convert::Infallible>(Attempt::Done(())),
            Ok(false) => {
                debug!(attempt, "prompt endpoint not initialised yet");
                Ok(Attempt::Pending)
            }
            Err(e) => {
                debug!(attempt, error = %e, "prompt endpoint probe failed");
                Ok(Attempt::Pending)
            }
        }
    })
    .await;
    match functional {
        Ok(Polled::Ready(())) => {
            info!("engine is ready");
            true
        }
        _ => {
            warn!(attempts = policy.max_attempts, "engine never accepted an empty graph");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;
    use std::time::Duration;

    const POLICY: RetryPolicy = RetryPolicy::new(Duration::from_millis(1), 5);

    #[tokio::test]
    async fn ready_engine_needs_one_call_per_tier() {
        let engine = FakeEngine::default();
        assert!(await_ready(&engine, POLICY).await);
        assert_eq!(FakeEngine::count(&engine.alive_calls), 1);
        assert_eq!(FakeEngine::count(&engine.probe_calls), 1);
    }

    #[tokio::test]
    async fn waits_through_startup() {
        let engine = FakeEngine { dead_for: 2, warming_for: 3, ..FakeEngine::default() };
        assert!(await_ready(&engine, POLICY).await);
        assert_eq!(FakeEngine::count(&engine.alive_calls), 3);
        assert_eq!(FakeEngine::count(&engine.probe_calls), 4);
    }

    #[tokio::test]
    async fn dead_engine_is_not_probed_functionally() {
        let engine = FakeEngine { dead_for: u32::MAX, ..FakeEngine::default() };
        assert!(!await_ready(&engine, POLICY).await);
        assert_eq!(FakeEngine::count(&engine.alive_calls), 5);
        assert_eq!(FakeEngine::count(&engine.probe_calls), 0);
    }

    #[tokio::test]
    async fn live_but_uninitialised_engine_times_out() {
        let engine = FakeEngine { warming_for: u32::MAX, ..FakeEngine::default() };
        assert!(!await_ready(&engine, POLICY).await);
        assert_eq!(FakeEngine::count(&engine.probe_calls), 5);
    }
}
