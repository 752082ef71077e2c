use crate::balancer::LoadBalancer;
use crate::breaker::BreakerRegistry;
use crate::config::Settings;
use crate::dedup::RequestDeduplicator;
use crate::error::{AppError, AppResult};
use crate::limiter::ConcurrencyLimiter;
use crate::store::Store;
use crate::summary_cache::{build_summary_cache, SummaryCache, SummaryStats};
use crate::token_cache::TokenCache;
use crate::transport::TransportPool;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Store,
    pub balancer: Arc<LoadBalancer>,
    pub breakers: Arc<BreakerRegistry>,
    pub token_cache: Arc<TokenCache>,
    pub http: Arc<reqwest::Client>,
    pub summary_cache: Option<Arc<dyn SummaryCache>>,
    pub summary_stats: Arc<SummaryStats>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub deduper: Arc<RequestDeduplicator>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_settings(Settings::from_env()).await
}

pub async fn load_state_with_settings(settings: Settings) -> AppResult<AppState> {
    let store = Store::new(&settings.database_dsn).await.map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_init_failed",
            err,
        )
    })?;

    let transport = TransportPool::new();
    let http = transport.client(&settings).await.map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "http_client_init_failed",
            err,
        )
    })?;

    let balancer = Arc::new(LoadBalancer::with_cache_ttl(
        store.clone(),
        Duration::from_secs(settings.balancer_cache_ttl_secs.max(1)),
    ));

    let summary_stats = Arc::new(SummaryStats::new());
    let summary_cache = build_summary_cache(
        &settings.summary_cache_mode,
        settings.summary_cache_size,
        Duration::from_secs(settings.summary_cache_ttl_secs),
        summary_stats.clone(),
    );
    tracing::info!(mode = %settings.summary_cache_mode, "summary cache configured");

    let limiter = ConcurrencyLimiter::new(
        settings.concurrency_limit,
        Duration::from_secs(settings.concurrency_timeout_secs),
    );

    let dedup_window = Duration::from_millis(settings.dedup_window_ms.max(1));
    let deduper = Arc::new(RequestDeduplicator::new(dedup_window));
    let sweeper = deduper.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(dedup_window * 2);
        loop {
            tick.tick().await;
            sweeper.sweep().await;
        }
    });

    let metrics = init_metrics()?;

    Ok(AppState {
        settings: Arc::new(settings),
        store,
        balancer,
        breakers: Arc::new(BreakerRegistry::new()),
        token_cache: Arc::new(TokenCache::new()),
        http,
        summary_cache,
        summary_stats,
        limiter,
        deduper,
        metrics,
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.settings.metrics_path.clone();
    Router::<AppState>::new()
        .route("/v1/messages", post(crate::handlers::create_messages))
        .route(
            "/orchids/v1/messages",
            post(crate::handlers::create_messages_orchids),
        )
        .route(
            "/warp/v1/messages",
            post(crate::handlers::create_messages_warp),
        )
        .route(
            "/grok/v1/messages",
            post(crate::handlers::create_messages_grok),
        )
        .route(
            "/grok/v1/chat/completions",
            post(crate::handlers::grok_chat_completions),
        )
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/v1/models/{model_id}", get(crate::handlers::get_model))
        .route(
            "/orchids/v1/models",
            get(crate::handlers::list_models_orchids),
        )
        .route(
            "/orchids/v1/models/{model_id}",
            get(crate::handlers::get_model_orchids),
        )
        .route("/warp/v1/models", get(crate::handlers::list_models_warp))
        .route(
            "/warp/v1/models/{model_id}",
            get(crate::handlers::get_model_warp),
        )
        .route("/grok/v1/models", get(crate::handlers::list_models_grok))
        .route(
            "/grok/v1/models/{model_id}",
            get(crate::handlers::get_model_grok),
        )
        .route("/health", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
