//! Background replica eviction.

use crate::db::ConnectionPool;
use crate::manager::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run [`ConnectionManager::remove_unhealthy_replicas`] every `interval`
/// until `cancel` fires.
///
/// Each cycle runs in its own task, so a cycle that panics is logged and the
/// routine carries on with the next tick. A zero `interval` falls back to
/// [`DEFAULT_HEALTH_CHECK_INTERVAL`].
pub fn spawn_health_routine<P: ConnectionPool>(
    manager: Arc<ConnectionManager<P>>,
    interval: Duration,
    probe_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = match interval.is_zero() {
        true => {
            tracing::warn!(default = ?DEFAULT_HEALTH_CHECK_INTERVAL, "Zero health check interval; using the default");
            DEFAULT_HEALTH_CHECK_INTERVAL
        },
        false => interval,
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; replicas were just probed on
        // admission, so wait a full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let cycle = tokio::spawn({
                let manager = Arc::clone(&manager);
                async move { manager.remove_unhealthy_replicas(probe_timeout).await }
            });
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = cycle => match result {
                    Ok(0) => tracing::trace!("All replicas healthy"),
                    Ok(removed) => tracing::info!(removed, "Removed unhealthy replicas"),
                    Err(e) if e.is_panic() => tracing::error!("Replica health check panicked; continuing"),
                    Err(e) => tracing::warn!(error = %e, "Replica health check aborted"),
                },
            }
        }
        tracing::debug!("Replica health routine stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::FakePool;

    fn manager(replicas: &[FakePool]) -> Arc<ConnectionManager<FakePool>> {
        Arc::new(ConnectionManager::from_parts(
            ("primary", FakePool::new("primary")),
            replicas.iter().map(|r| (r.name, r.clone())),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_evicts_dead_replicas() {
        let replicas = [FakePool::new("r1"), FakePool::new("r2")];
        let manager = manager(&replicas);
        let cancel = CancellationToken::new();
        let handle =
            spawn_health_routine(Arc::clone(&manager), Duration::from_secs(30), Duration::from_secs(1), cancel.clone());
        replicas[0].set_healthy(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.replica_names().await, ["r2"]);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_survives_panics() {
        let replicas = [FakePool::new("r1")];
        let manager = manager(&replicas);
        let cancel = CancellationToken::new();
        replicas[0].set_panicking(true);
        let handle =
            spawn_health_routine(Arc::clone(&manager), Duration::from_secs(1), Duration::from_secs(1), cancel.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        // Once the probe stops panicking the next cycle evicts normally.
        replicas[0].set_panicking(false);
        replicas[0].set_healthy(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.replica_count().await, 0);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_uses_default() {
        let replicas = [FakePool::new("r1")];
        let manager = manager(&replicas);
        let cancel = CancellationToken::new();
        let handle = spawn_health_routine(Arc::clone(&manager), Duration::ZERO, Duration::from_secs(1), cancel.clone());
        replicas[0].set_healthy(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!handle.is_finished());
        assert_eq!(manager.replica_count().await, 1);
        tokio::time::sleep(DEFAULT_HEALTH_CHECK_INTERVAL).await;
        assert_eq!(manager.replica_count().await, 0);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_routine() {
        let cancel = CancellationToken::new();
        let handle =
            spawn_health_routine(manager(&[]), DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_PROBE_TIMEOUT, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
