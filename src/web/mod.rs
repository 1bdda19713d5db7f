//! Web server module

mod middleware;
mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::config::Config;
use crate::db::{Database, PageviewSender};
use crate::estimate::Estimator;
use crate::geoip::SharedGeoIp;
use crate::visitor::VisitorHasher;

pub use middleware::ClientIp;

pub struct AppState {
    pub db: Database,
    pub estimator: Arc<Estimator>,
    pub geoip: SharedGeoIp,
    pub visitors: VisitorHasher,
    pub pageview_tx: PageviewSender,
    /// Bearer token for forced rescans; empty disables the endpoint
    pub admin_token: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    // The tracking snippet posts from arbitrary customer origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/websites", post(routes::register_website))
        .route("/api/event", post(routes::track_event))
        .route("/api/websites/:id/emissions", get(routes::website_emissions))
        .route("/api/websites/:id/scan", post(routes::force_scan))
        .route("/api/calculate", get(routes::calculate))
        .route("/api/intensity", get(routes::intensity))
        .layer(middleware::RequestLoggingLayer)
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let bind = format!("{}:{}", config.server.host, config.server.http_port);
    let addr: SocketAddr = tokio::net::lookup_host(&bind)
        .await?
        .next()
        .with_context(|| format!("could not resolve listen address {}", bind))?;

    if config.tls_enabled() {
        let tls = RustlsConfig::from_pem_file(&config.server.tls_cert, &config.server.tls_key)
            .await
            .context("failed to load TLS certificate")?;
        info!("Web server starting on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
    } else {
        info!("Web server starting on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    }

    Ok(())
}
