use crate::apps::AppStore;
use crate::config::GatewayConfig;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::store::KvStore;
use crate::worker::WorkerPool;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// All cross-node coordination lives in the KV store; this struct is just
/// the wiring — store adapter, app repository, decision engine, and this
/// node's worker pool (which owns the node id and the request stream).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub store: KvStore,
    pub apps: AppStore,
    pub limiter: RateLimiter,
    pub http: reqwest::Client,
    pub pool: Arc<WorkerPool>,
}

impl GatewayState {
    /// Connect to the store and acquire this node's identity. Fails fast:
    /// a node that cannot reach the store or get an id must not serve.
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let store = KvStore::connect(&config.redis, &config.limiter).await?;
        info!("store: connected, url={}", config.redis.connection_url());

        let apps = AppStore::new(store.clone());
        let limiter = RateLimiter::new(store.clone());
        let http = reqwest::Client::new();

        let pool = WorkerPool::start(
            store.clone(),
            apps.clone(),
            limiter.clone(),
            http.clone(),
            config.workers.clone(),
            config.queue.clone(),
        )
        .await?;

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            store,
            apps,
            limiter,
            http,
            pool,
        })
    }
}
