use anyhow::{Context, Result};
use axum::http::{
    header::{HeaderName, HeaderValue, X_CONTENT_TYPE_OPTIONS},
    Method, StatusCode,
};
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;

use cms_proxy::{app, parse_ttl, AppConfig, ProxyServer, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config_data = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("failed to read {config_path}"))?;
    let mut config = AppConfig::from_yaml(&config_data)?;
    config.apply_env(|name| std::env::var(name).ok());

    let server = ProxyServer::new(&config)?;

    if let Some(interval) = &config.cache.sweep_interval {
        server.spawn_sweeper(parse_ttl(interval)?);
    }

    let request_timeout = parse_ttl(&config.server.request_timeout)?;
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(Any);

    let router = app(server)
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();
    for addr in config.server.socket_addrs()? {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;
        info!(%addr, ttl = %config.cache.ttl, "cms-proxy listening");

        let service = router.clone().into_make_service_with_connect_info::<SocketAddr>();
        let mut shutdown = shutdown_rx.clone();
        servers.spawn(async move {
            axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
                .with_context(|| format!("server on {addr} failed"))
        });
    }

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    while let Some(joined) = servers.join_next().await {
        joined.context("server task panicked")??;
    }

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to create SIGTERM handler: {:?}", e);
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to create SIGINT handler: {:?}", e);
            return;
        }
    };

    select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
