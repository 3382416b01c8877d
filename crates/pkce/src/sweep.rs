//! Periodic expiry sweep
//!
//! `claim` already treats expired records as absent and drops the ones it
//! touches; the sweep bounds memory for records nobody ever tries to redeem.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::registry::ChallengeRegistry;

/// Spawn a background task that removes expired challenges every `interval`.
///
/// `on_sweep` receives the number of records left after each pass (the
/// service feeds it into a gauge). Returns the task's `JoinHandle`; abort it
/// to stop sweeping.
pub fn spawn_sweep_task<F>(
    registry: Arc<ChallengeRegistry>,
    interval: Duration,
    on_sweep: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(usize) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick: the registry starts empty
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = registry.sweep_expired();
            let remaining = registry.len();
            debug!(removed, remaining, "expiry sweep finished");
            on_sweep(remaining);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::compute_challenge;
    use crate::method::{ChallengeMethod, ExchangeType};
    use crate::registry::{RegistrationRequest, RegistrySettings};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(ttl_secs: u64) -> Arc<ChallengeRegistry> {
        Arc::new(ChallengeRegistry::new(RegistrySettings {
            ttl: Duration::from_secs(ttl_secs),
            ..RegistrySettings::default()
        }))
    }

    fn register(registry: &ChallengeRegistry) -> String {
        registry
            .register(RegistrationRequest {
                client_id: "app1".into(),
                code_challenge: compute_challenge("verifier"),
                code_challenge_method: ChallengeMethod::S256,
                requested_exchange_type: ExchangeType::CLIENT,
            })
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_reclaims_expired_records() {
        let registry = registry(10);
        register(&registry);
        register(&registry);

        let last_remaining = Arc::new(AtomicUsize::new(usize::MAX));
        let observed = last_remaining.clone();
        let handle = spawn_sweep_task(registry.clone(), Duration::from_secs(5), move |n| {
            observed.store(n, Ordering::SeqCst)
        });

        // First pass at t=5s: nothing has expired yet
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.len(), 2);
        assert_eq!(last_remaining.load(Ordering::SeqCst), 2);

        // Pass at t=10s or t=15s removes both
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.is_empty());
        assert_eq!(last_remaining.load(Ordering::SeqCst), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_keeps_live_records() {
        let registry = registry(600);
        let code_id = register(&registry);

        let handle = spawn_sweep_task(registry.clone(), Duration::from_secs(1), |_| {});
        tokio::time::sleep(Duration::from_secs(30)).await;

        registry.consume(&code_id).unwrap();
        handle.abort();
    }
}
