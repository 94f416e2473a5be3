use std::sync::Arc;

use axum::http::HeaderName;
use axum::routing::get;
use axum::Router;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

mod chat;
mod circuit_breaker;
mod config;
mod events;
mod janitor;
mod matching;
mod models;
mod presence;
mod routes;
mod schema;
mod socket;
mod stats;
mod store;

use config::AppConfig;
use matcher_shared::clients::rabbitmq::RabbitMQClient;
use matcher_shared::clients::redis::RedisClient;
use matcher_shared::middleware::{init_metrics, init_tracing, metrics_middleware};

use chat::ChatRouter;
use matching::matcher::Matcher;
use presence::ConnectionHub;
use stats::StatsBroadcaster;
use store::Store;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Client-origin allow-list (spec §6). A single `"*"` entry opts into
/// permissive CORS for local development; anything else is parsed as an
/// explicit origin list, the same fallback the video-room gateway's
/// `build_cors_layer` uses.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        return CorsLayer::permissive();
    }

    let origins: Vec<_> = allowed_origins
        .iter()
        .filter(|o| !o.is_empty())
        .map(|o| o.parse().expect("invalid origin in MATCHER__ALLOWED_ORIGINS"))
        .collect();

    tracing::info!(count = origins.len(), "CORS: restricted to configured origin(s)");

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([HeaderName::from_static("content-type"), HeaderName::from_static("authorization")])
}

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Store>,
    pub hub: Arc<ConnectionHub>,
    pub stats: Arc<StatsBroadcaster>,
    pub matcher: Arc<Matcher>,
    pub chat_router: Arc<ChatRouter>,
    pub io: SocketIo,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("matcher-core");
    let metrics_handle = init_metrics();

    let config = Arc::new(AppConfig::load()?);
    let port = config.port;

    let db = matcher_shared::clients::db::create_pool(&config.database_url);
    let store = Arc::new(Store::new(db));

    let redis = Arc::new(RedisClient::connect(&config.redis_url).await?);
    let rabbitmq = Arc::new(RabbitMQClient::connect(&config.rabbitmq_url).await?);

    // Socket.IO layer built before state — ConnectionHub needs the `io`
    // handle to broadcast to rooms, so state is threaded through each
    // handler via closures captured at `io.ns` registration instead of
    // socketioxide's own `with_state` (the messaging service's call
    // signaling socket uses the same closure-capture idiom).
    // Connection liveness (spec §5): engine.io's own ping/pong drives the
    // heartbeat interval/timeout rather than a hand-rolled timer.
    // Message payload cap (spec §5): 1 MiB per frame, larger frames are
    // rejected by the engine.io transport before a handler ever sees them.
    let (sio_layer, io) = SocketIo::builder()
        .ping_interval(std::time::Duration::from_secs(config.heartbeat_interval_secs))
        .ping_timeout(std::time::Duration::from_secs(config.heartbeat_timeout_secs))
        .max_payload(1_048_576)
        .build_layer();

    let hub = Arc::new(ConnectionHub::new(io.clone(), store.clone(), config.clone()));
    let stats = StatsBroadcaster::new(store.clone(), hub.clone());
    hub.set_stats(stats.clone());

    let matcher = Matcher::new(
        store.clone(),
        hub.clone(),
        stats.clone(),
        redis.clone(),
        rabbitmq.clone(),
        config.clone(),
    );
    hub.set_matcher(matcher.clone());

    let chat_router = ChatRouter::new(store.clone(), hub.clone(), rabbitmq.clone());

    janitor::spawn(store.clone(), hub.clone(), stats.clone(), config.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        hub,
        stats,
        matcher,
        chat_router,
        io: io.clone(),
        metrics_handle,
    });

    io.ns("/", {
        let state = state.clone();
        move |socket: socketioxide::extract::SocketRef,
              socketioxide::extract::Data(auth): socketioxide::extract::Data<serde_json::Value>| {
            let state = state.clone();
            async move {
                socket::handlers::on_connect_with_state(socket, auth, state).await;
            }
        }
    });

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .layer(sio_layer)
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(build_cors_layer(&config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "matcher-core starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
