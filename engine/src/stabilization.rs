//! Stabilization Coordinator (spec §4.12): on a full-mode identity load, wait
//! for the DHT routing table to warm up before trusting it for background
//! sync, rather than firing sync work against an empty routing table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_protocol::DhtFacade;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_NODES: usize = 2;

/// Gates concurrent stabilization runs behind one flag, the same pattern
/// [`crate::lifecycle::LifecycleController`] uses for `resume`.
pub struct StabilizationCoordinator {
    retry_running: AtomicBool,
}

impl StabilizationCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { retry_running: AtomicBool::new(false) })
    }

    pub fn is_running(&self) -> bool {
        self.retry_running.load(Ordering::SeqCst)
    }

    /// Spawn the wait-then-sync task. `sync` is the best-effort background
    /// sync closure (contacts, groups, GEKs, addressbook, pending-message
    /// retry) — called at most once per spawn, skipped entirely if another
    /// run is already in flight.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        facade: Arc<dyn DhtFacade>,
        timeout_secs: u64,
        sync: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if coordinator
                .retry_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
            while facade.node_count().await < MIN_NODES && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(POLL_INTERVAL).await;
            }

            sync().await;
            coordinator.retry_running.store(false, Ordering::SeqCst);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_protocol::FakeDhtFacade;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn sync_runs_once_routing_table_warms_up() {
        let facade = FakeDhtFacade::new();
        facade.set_node_count(0);
        let coordinator = StabilizationCoordinator::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let facade_for_warmup = facade.clone();

        let handle = coordinator.spawn(facade.clone(), 5, move || async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        facade_for_warmup.set_node_count(2);
        handle.await.unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_spawn_is_skipped_while_one_is_running() {
        let facade = FakeDhtFacade::new();
        facade.set_node_count(5);
        let coordinator = StabilizationCoordinator::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let ran1 = ran.clone();
        let first = coordinator.spawn(facade.clone(), 5, move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ran1.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ran2 = ran.clone();
        let second = coordinator.spawn(facade.clone(), 5, move || async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
