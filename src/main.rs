//! carbonlens - Carbon emission estimates for privacy-friendly website analytics
//!
//! Scans registered websites, attributes each resource to a hosting country
//! and a green-hosting status, predicts grid carbon intensities and turns the
//! result into per-pageview or yearly emission estimates.

mod aggregate;
mod config;
mod countries;
mod db;
mod emission;
mod error;
mod estimate;
mod geoip;
mod model;
mod predict;
mod refresh;
mod upstream;
mod visitor;
mod web;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::refresh::{ScanRefresher, Scanner, StalenessPolicy};
use crate::upstream::{
    CachedGreenClassifier, CachedIntensitySource, HttpGreenClassifier, HttpIntensitySource, HttpIpResolver,
    HttpScanSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter())
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }

    info!("Starting carbonlens...");

    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let geoip = Arc::new(geoip::GeoIp::new(&config.geoip.database));
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found)");
    }

    let client = upstream::build_client(&config.upstream)?;
    let scanner = Scanner {
        source: Arc::new(HttpScanSource::new(client.clone(), &config.upstream)),
        resolver: Arc::new(HttpIpResolver::new(client.clone(), &config.upstream)),
        classifier: Arc::new(CachedGreenClassifier::new(
            HttpGreenClassifier::new(client.clone(), &config.upstream)?,
            config.estimation.green_cache_secs,
        )),
    };
    let intensity = Arc::new(CachedIntensitySource::new(
        HttpIntensitySource::new(client, &config.upstream),
        config.estimation.intensity_cache_secs,
    ));

    let refresher = Arc::new(ScanRefresher::new(
        db.clone(),
        scanner,
        StalenessPolicy::new(config.estimation.stale_after_days),
    ));
    let estimator = Arc::new(estimate::Estimator::new(
        db.clone(),
        refresher,
        intensity,
        config.estimation.pageview_window_days,
    ));

    // Pageviews from the tracking endpoint are written in batches
    let pageview_tx = db::start_write_buffer(Arc::new(db.clone()));

    if config.server.admin_token.is_empty() {
        info!("No admin token configured, forced rescans are disabled");
    }

    let state = Arc::new(web::AppState {
        db,
        estimator,
        geoip,
        visitors: visitor::VisitorHasher::new(),
        pageview_tx,
        admin_token: config.server.admin_token.clone(),
    });

    web::start_server(&config, state).await?;

    Ok(())
}
