//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub geoip: GeoIpConfig,
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub estimation: EstimationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    /// Bearer token required to force a rescan; empty disables the endpoint
    #[serde(default)]
    pub admin_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoIpConfig {
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Endpoints of the external collaborators
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// HAR scanning service, called as `{scan_url}?url=<site>`
    pub scan_url: String,
    /// Batch IP geolocation endpoint (ip-api compatible)
    pub ip_batch_url: String,
    /// Green hosting lookup, called as `{green_url}/<JSON array of hosts>`
    pub green_url: String,
    /// Grid intensity data, called as `{intensity_url}?countries=<alpha-3,...>`
    pub intensity_url: String,
    #[serde(default)]
    pub intensity_api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after the first failure (0 = fail fast)
    #[serde(default)]
    pub retries: u32,
}

fn default_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimationConfig {
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
    #[serde(default = "default_green_cache_secs")]
    pub green_cache_secs: u64,
    #[serde(default = "default_intensity_cache_secs")]
    pub intensity_cache_secs: u64,
    #[serde(default = "default_pageview_window_days")]
    pub pageview_window_days: i64,
}

fn default_stale_after_days() -> i64 {
    14
}

fn default_green_cache_secs() -> u64 {
    24 * 3600
}

fn default_intensity_cache_secs() -> u64 {
    6 * 3600
}

fn default_pageview_window_days() -> i64 {
    30
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
            green_cache_secs: default_green_cache_secs(),
            intensity_cache_secs: default_intensity_cache_secs(),
            pageview_window_days: default_pageview_window_days(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("CARBONLENS").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        // Validate TLS (both or neither must be set)
        let has_cert = !self.server.tls_cert.is_empty();
        let has_key = !self.server.tls_key.is_empty();
        if has_cert != has_key {
            anyhow::bail!("TLS configuration incomplete: both tls_cert and tls_key must be set, or neither");
        }

        for (name, value) in [
            ("scan_url", &self.upstream.scan_url),
            ("ip_batch_url", &self.upstream.ip_batch_url),
            ("green_url", &self.upstream.green_url),
            ("intensity_url", &self.upstream.intensity_url),
        ] {
            if url::Url::parse(value).is_err() {
                anyhow::bail!("Invalid upstream.{}: '{}' is not a URL", name, value);
            }
        }
        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be positive");
        }

        if self.estimation.stale_after_days <= 0 {
            anyhow::bail!("estimation.stale_after_days must be positive");
        }
        if self.estimation.pageview_window_days <= 0 {
            anyhow::bail!("estimation.pageview_window_days must be positive");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.server.tls_cert.is_empty() && !self.server.tls_key.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            http_port: 8080,
            tls_cert: String::new(),
            tls_key: String::new(),
            admin_token: "secret".into(),
        },
        database: DatabaseConfig {
            url: "carbonlens.db".into(),
        },
        geoip: GeoIpConfig {
            database: "GeoLite2-Country.mmdb".into(),
        },
        logging: LoggingConfig { level: "info".into() },
        upstream: UpstreamConfig {
            scan_url: "http://localhost:9000/scan".into(),
            ip_batch_url: "http://localhost:9001/batch".into(),
            green_url: "http://localhost:9002/greencheckmulti".into(),
            intensity_url: "http://localhost:9003/intensity".into(),
            intensity_api_key: String::new(),
            timeout_secs: 20,
            retries: 0,
        },
        estimation: EstimationConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_defaults() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.estimation.stale_after_days, 14);
        assert!(!config.tls_enabled());
    }

    #[test]
    fn rejects_half_configured_tls() {
        let mut config = test_config();
        config.server.tls_cert = "cert.pem".into();
        assert!(config.validate().is_err());
        config.server.tls_key = "key.pem".into();
        assert!(config.validate().is_ok());
        assert!(config.tls_enabled());
    }

    #[test]
    fn rejects_bad_upstream_url_and_level() {
        let mut config = test_config();
        config.upstream.green_url = "not a url".into();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
