use crate::apps::AppStore;
use crate::config::{QueueConfig, WorkerPoolConfig};
use crate::limiter::RateLimiter;
use crate::queue::RequestStream;
use crate::store::KvStore;
use crate::worker::{NodeIdAllocator, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the node identity and the worker lifecycle for this node.
///
/// Lifecycle:
/// 1. `start()` — acquire a node id, create the stream's consumer group
/// 2. `run()` — the scaling loop: every interval, observe the backlog and
///    spawn/retire one worker, then enforce the stream length cap
/// 3. `shutdown()` — stop workers, remove their consumers, return the id
///
/// All worker coordination goes through the shared store; the only
/// in-process state is the worker handle list, confined to this manager.
pub struct WorkerPool {
    store: KvStore,
    apps: AppStore,
    limiter: RateLimiter,
    stream: RequestStream,
    http: reqwest::Client,
    allocator: NodeIdAllocator,
    node_id: String,
    workers_cfg: WorkerPoolConfig,
    queue_cfg: QueueConfig,
    workers: Mutex<Vec<WorkerHandle>>,
}

struct WorkerHandle {
    consumer: String,
    cancel: CancellationToken,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// One step of the scaling policy.
#[derive(Debug, PartialEq, Eq)]
enum ScaleAction {
    Spawn,
    Retire,
    Hold,
}

/// Scaling decision for an observed backlog. `backlog == 0` counts as a
/// spawn condition, so an idle node always has workers ready before the
/// first deferred request lands.
fn scale_action(backlog: u64, workers: usize, lo: u64, hi: usize) -> ScaleAction {
    if (backlog > lo || backlog == 0) && workers < hi {
        ScaleAction::Spawn
    } else if backlog < lo / 2 && workers > 1 {
        ScaleAction::Retire
    } else {
        ScaleAction::Hold
    }
}

impl WorkerPool {
    pub async fn start(
        store: KvStore,
        apps: AppStore,
        limiter: RateLimiter,
        http: reqwest::Client,
        workers_cfg: WorkerPoolConfig,
        queue_cfg: QueueConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let allocator = NodeIdAllocator::new(store.clone());
        let node_id = match workers_cfg.node_id {
            Some(ref preset) => preset.clone(),
            None => allocator.acquire().await?,
        };

        let stream = RequestStream::new(store.clone(), &node_id);
        stream.create_group().await?;
        info!(
            "pool: node ready, node_id={}, stream={}",
            node_id,
            stream.stream_key()
        );

        Ok(Arc::new(Self {
            store,
            apps,
            limiter,
            stream,
            http,
            allocator,
            node_id,
            workers_cfg,
            queue_cfg,
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn stream(&self) -> &RequestStream {
        &self.stream
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// The scaling loop. Returns when `shutdown` is notified; the caller
    /// then invokes [`WorkerPool::shutdown`].
    pub async fn run(&self, shutdown: Arc<Notify>) {
        let interval = Duration::from_secs(self.workers_cfg.scale_interval_secs);
        // Register the waiter once so a notification arriving while the
        // loop is inside `scale_once` is not lost.
        let notified = shutdown.notified();
        tokio::pin!(notified);
        // First pass right away so an idle node has a worker before the
        // first interval elapses.
        self.scale_once().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut notified => {
                    info!("pool: scaling loop stopped, node_id={}", self.node_id);
                    return;
                }
            }
            self.scale_once().await;
        }
    }

    async fn scale_once(&self) {
        let backlog = match self.stream.len().await {
            Ok(len) => len,
            Err(e) => {
                warn!("pool: failed to read stream length, error={}", e);
                return;
            }
        };

        let count = self.worker_count().await;
        match scale_action(
            backlog,
            count,
            self.workers_cfg.max_queued_requests,
            self.workers_cfg.max_workers,
        ) {
            ScaleAction::Spawn => self.spawn_worker().await,
            ScaleAction::Retire => self.retire_worker().await,
            ScaleAction::Hold => {}
        }

        match self.stream.enforce_max_len(self.queue_cfg.max_stream_length).await {
            Ok(0) => {}
            Ok(trimmed) => {
                warn!(
                    "pool: stream over cap, trimmed, node_id={}, dropped={}",
                    self.node_id, trimmed
                );
                metrics::counter!("gateway_stream_trimmed_total").increment(trimmed);
            }
            Err(e) => warn!("pool: trim failed, error={}", e),
        }

        metrics::gauge!("gateway_stream_length").set(backlog as f64);
        metrics::gauge!("gateway_workers_active").set(self.worker_count().await as f64);
    }

    async fn spawn_worker(&self) {
        let mut workers = self.workers.lock().await;

        // CONSUMER_ID names the first worker; later ones are timestamped.
        let consumer = match self.workers_cfg.consumer_id {
            Some(ref preset) if workers.is_empty() => preset.clone(),
            _ => format!("{}:worker:{}", self.node_id, crate::limiter::now_ms()),
        };

        let worker = Worker::new(
            self.store.clone(),
            self.apps.clone(),
            self.limiter.clone(),
            self.stream.clone(),
            self.http.clone(),
            consumer.clone(),
            self.workers_cfg.batch_size,
            Duration::from_secs(self.workers_cfg.block_timeout_secs),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        info!("pool: worker spawned, consumer={}", consumer);

        workers.push(WorkerHandle {
            consumer,
            cancel,
            handle,
        });
    }

    /// Stop the most recently spawned worker. After the grace period its
    /// consumer is removed from the group; entries it still holds become
    /// ownerless in the group (no claim recovery is performed).
    async fn retire_worker(&self) {
        let retired = {
            let mut workers = self.workers.lock().await;
            workers.pop()
        };
        let Some(retired) = retired else {
            return;
        };

        retired.cancel.cancel();
        tokio::time::sleep(Duration::from_secs(self.workers_cfg.stop_grace_secs)).await;

        if let Err(e) = self.stream.delete_consumer(&retired.consumer).await {
            warn!(
                "pool: failed to remove consumer, consumer={}, error={}",
                retired.consumer, e
            );
        }
        info!("pool: worker retired, consumer={}", retired.consumer);
    }

    /// Stop all workers, remove their consumers, and return the node id to
    /// the free pool.
    pub async fn shutdown(&self) {
        let drained = {
            let mut workers = self.workers.lock().await;
            std::mem::take(&mut *workers)
        };

        for worker in &drained {
            worker.cancel.cancel();
        }
        if !drained.is_empty() {
            tokio::time::sleep(Duration::from_secs(self.workers_cfg.stop_grace_secs)).await;
        }
        for worker in &drained {
            if let Err(e) = self.stream.delete_consumer(&worker.consumer).await {
                warn!(
                    "pool: failed to remove consumer, consumer={}, error={}",
                    worker.consumer, e
                );
            }
        }

        if let Err(e) = self.allocator.release(&self.node_id).await {
            warn!(
                "pool: failed to release node id, node_id={}, error={}",
                self.node_id, e
            );
        }
        info!("pool: shutdown complete, node_id={}", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LO: u64 = 100;
    const HI: usize = 10;

    #[test]
    fn test_spawns_on_backlog_above_lo() {
        assert_eq!(scale_action(101, 3, LO, HI), ScaleAction::Spawn);
    }

    #[test]
    fn test_spawns_on_empty_stream() {
        // An idle node still holds one worker ready.
        assert_eq!(scale_action(0, 0, LO, HI), ScaleAction::Spawn);
    }

    #[test]
    fn test_never_exceeds_max_workers() {
        assert_eq!(scale_action(10_000, HI, LO, HI), ScaleAction::Hold);
        assert_eq!(scale_action(0, HI, LO, HI), ScaleAction::Hold);
    }

    #[test]
    fn test_retires_below_half_lo() {
        assert_eq!(scale_action(49, 3, LO, HI), ScaleAction::Retire);
    }

    #[test]
    fn test_keeps_last_worker() {
        assert_eq!(scale_action(49, 1, LO, HI), ScaleAction::Hold);
    }

    #[test]
    fn test_holds_in_comfort_band() {
        // Between lo/2 and lo nothing changes.
        assert_eq!(scale_action(60, 3, LO, HI), ScaleAction::Hold);
        assert_eq!(scale_action(100, 3, LO, HI), ScaleAction::Hold);
    }
}
