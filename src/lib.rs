//! Relay gateway: one OpenAI-style API in front of many LLM providers,
//! metered against prepaid token and user balances.
//!
//! The binary (`relayd`) wires these modules to Postgres and Redis; the
//! integration tests in `tests/` drive [`app`] directly against an
//! in-memory store.

pub mod cache;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod notification;
pub mod proxy;
pub mod store;

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use cache::TieredCache;
use config::Config;
use jobs::batch_update::BatchUpdater;
use middleware::metrics::RelayMetrics;
use middleware::quota::QuotaLedger;
use middleware::rate_limit::RateLimiter;
use models::channel_cache::ChannelCache;
use notification::Notifier;
use proxy::adapter::AdapterRegistry;
use proxy::failover::FailoverController;
use proxy::handler;
use proxy::relay::Relay;
use proxy::selector::ChannelSelector;
use proxy::upstream::UpstreamClient;
use store::RelayStore;

/// Image generation payloads carry base64 inputs; 25 MB covers them.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RelayStore>,
    pub cache: TieredCache,
    pub channels: ChannelCache,
    pub ledger: Arc<QuotaLedger>,
    /// Present when batch mode is on; the server spawns its flush job.
    pub batch: Option<Arc<BatchUpdater>>,
    pub rate_limiter: RateLimiter,
    pub relay: Relay,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    /// Assemble the relay core. The channel index starts empty; callers load
    /// it with [`jobs::channel_sync::sync_once`].
    pub fn new(
        config: Config,
        store: Arc<dyn RelayStore>,
        cache: TieredCache,
        notifier: Arc<dyn Notifier>,
        client: UpstreamClient,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let channels = ChannelCache::new();

        let batch = config
            .batch_update_enabled
            .then(|| Arc::new(BatchUpdater::new(store.clone())));
        let mut ledger = QuotaLedger::new(store.clone(), notifier, &config);
        if let Some(batch) = &batch {
            ledger = ledger.with_batch(batch.clone());
        }
        let ledger = Arc::new(ledger);

        let metrics = Arc::new(RelayMetrics::new().context("failed to register metrics")?);

        let selector = ChannelSelector::new(
            channels.clone(),
            store.clone(),
            config.channel_health.clone(),
        );
        let failover = FailoverController::new(Arc::new(selector), config.retry_times);
        let relay = Relay::new(
            AdapterRegistry::new(client),
            failover,
            ledger.clone(),
            metrics.clone(),
            config.clone(),
        );
        let rate_limiter = RateLimiter::new(cache.clone(), config.rate_limits.clone());

        Ok(Self {
            config,
            store,
            cache,
            channels,
            ledger,
            batch,
            rate_limiter,
            relay,
            metrics,
        })
    }
}

/// The HTTP surface.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ]);

    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(handler::healthz))
        .route("/metrics", get(handler::metrics))
        .route("/api/status", get(handler::status))
        .route("/v1/models", get(handler::list_models))
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/v1/images/generations", post(handler::image_generations))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
