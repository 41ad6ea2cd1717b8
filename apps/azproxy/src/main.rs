use std::error::Error;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};
use azproxy_core::bootstrap_from_env;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("azproxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let boot = bootstrap_from_env().await?;
    let config = boot.config;
    info!(
        host = %config.host,
        port = config.port,
        api_base = %config.api_base,
        models = config.model_mapping.len(),
        proxy = %config.proxy.as_deref().unwrap_or(""),
        cors = config.cors,
        "config loaded"
    );
    for (model, deployment) in &config.model_mapping {
        info!(model = %model, deployment = %deployment, "model mapped");
    }
    boot.core.log_routes();

    let mut app = Router::new()
        .route("/", get(|| async { "Hello World" }))
        .route("/health", any(|| async { StatusCode::OK }))
        .merge(boot.core.router());
    if config.cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown complete");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("azproxy=info,azproxy_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
