//! External collaborators of the estimation pipeline
//!
//! Every service sits behind a trait so the pipeline can run against fakes.
//! HTTP implementations parse responses into boundary structs and validate
//! them before anything reaches the domain types.

pub mod green;
pub mod intensity;
pub mod ip;
pub mod scan;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::model::GridIntensitySeries;

pub use green::{CachedGreenClassifier, HttpGreenClassifier};
pub use intensity::{CachedIntensitySource, HttpIntensitySource};
pub use ip::HttpIpResolver;
pub use scan::{HttpScanSource, RawScan};

#[async_trait]
pub trait ScanSource: Send + Sync {
    /// Load `url` and report every network request it made
    async fn scan(&self, url: &Url) -> Result<RawScan>;
}

#[async_trait]
pub trait IpCountryResolver: Send + Sync {
    /// Alpha-2 country per IP; unresolvable IPs are absent
    async fn resolve(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, String>>;
}

#[async_trait]
pub trait GreenClassifier: Send + Sync {
    /// The subset of `hosts` confirmed as renewably hosted
    async fn green_hosts(&self, hosts: &[String]) -> Result<HashSet<String>>;
}

#[async_trait]
pub trait IntensitySource: Send + Sync {
    /// Series for the given alpha-2 countries; an empty slice asks for all of them
    async fn series(&self, countries: &[String]) -> Result<Vec<GridIntensitySeries>>;
}

/// Shared outbound client with an explicit per-call timeout
pub fn build_client(config: &UpstreamConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(concat!("carbonlens/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Run `op`, retrying upstream failures up to `retries` extra times
pub(crate) async fn with_retries<T, F, Fut>(service: &'static str, retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ Error::Upstream { .. }) if attempt < retries => {
                attempt += 1;
                warn!("{} attempt {} failed, retrying: {}", service, attempt, e);
                tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Send a request and decode a JSON body, mapping every failure to an upstream error
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::upstream(service, e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::upstream(service, e))?;

    if !status.is_success() {
        return Err(Error::upstream(service, upstream_message(status, &body)));
    }

    serde_json::from_str(&body)
        .map_err(|e| Error::upstream(service, format!("malformed response: {}", e)))
}

/// Prefer the upstream's own error message, else the HTTP status
fn upstream_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "message"]
                .iter()
                .find_map(|key| v.get(key).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| format!("HTTP {}", status))
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory collaborators for pipeline tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeScanSource {
        pub scans: HashMap<String, RawScan>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl ScanSource for FakeScanSource {
        async fn scan(&self, url: &Url) -> Result<RawScan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scans
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| Error::upstream("scan", format!("no scan for {}", url)))
        }
    }

    #[derive(Default)]
    pub struct FakeIpResolver {
        pub countries: HashMap<IpAddr, String>,
    }

    #[async_trait]
    impl IpCountryResolver for FakeIpResolver {
        async fn resolve(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, String>> {
            Ok(ips
                .iter()
                .filter_map(|ip| self.countries.get(ip).map(|c| (*ip, c.clone())))
                .collect())
        }
    }

    #[derive(Default)]
    pub struct FakeGreenClassifier {
        pub green: HashSet<String>,
        pub requested: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl GreenClassifier for FakeGreenClassifier {
        async fn green_hosts(&self, hosts: &[String]) -> Result<HashSet<String>> {
            self.requested
                .lock()
                .map_err(|_| Error::upstream("green classifier", "poisoned"))?
                .push(hosts.to_vec());
            Ok(hosts.iter().filter(|h| self.green.contains(*h)).cloned().collect())
        }
    }

    #[derive(Default)]
    pub struct FakeIntensitySource {
        pub series: Vec<GridIntensitySeries>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl IntensitySource for FakeIntensitySource {
        async fn series(&self, countries: &[String]) -> Result<Vec<GridIntensitySeries>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .series
                .iter()
                .filter(|s| countries.is_empty() || countries.contains(&s.country_code))
                .cloned()
                .collect())
        }
    }

    pub struct FailingUpstream;

    #[async_trait]
    impl ScanSource for FailingUpstream {
        async fn scan(&self, _url: &Url) -> Result<RawScan> {
            Err(Error::upstream("scan", "HTTP 503 Service Unavailable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn prefers_upstream_error_message() {
        let status = reqwest::StatusCode::BAD_GATEWAY;
        assert_eq!(upstream_message(status, r#"{"error":"rate limited"}"#), "rate limited");
        assert_eq!(upstream_message(status, r#"{"message":"nope"}"#), "nope");
        assert_eq!(upstream_message(status, "<html>"), "HTTP 502 Bad Gateway");
    }

    #[tokio::test]
    async fn fails_fast_without_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries("scan", 0, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::upstream("scan", "down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let result = with_retries("scan", 2, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::upstream("scan", "flaky"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries("scan", 5, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("bad url"))
        })
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
