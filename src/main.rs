use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_gateway::config::Config;
use realtime_gateway::db::store::PgStore;
use realtime_gateway::gateway::realip::{HttpRangeSource, RealIpResolver};
use realtime_gateway::gateway::registry::ConnectionRegistry;
use realtime_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Connect to PostgreSQL. The gateway cannot run without its store, so a
    // failed probe takes the process down.
    let db = realtime_gateway::db::pool::connect(&config.database_url).await;
    if let Err(e) = db.get().await {
        tracing::error!(%e, "database connection failed, exiting");
        std::process::exit(1);
    }
    tracing::info!("database connection successful");

    let realip = RealIpResolver::new(Arc::new(HttpRangeSource::new(
        &config.ranges_v4_url,
        &config.ranges_v6_url,
    )));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid HOST/PORT");

    let state = AppState {
        config: Arc::new(config),
        store: Arc::new(PgStore::new(db)),
        registry: Arc::new(ConnectionRegistry::new()),
        realip: Arc::new(realip),
    };

    let app = realtime_gateway::gateway::server::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
