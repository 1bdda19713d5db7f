//! HAR scanning service client

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info};
use url::Url;

use super::{fetch_json, with_retries, ScanSource};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

const SERVICE: &str = "scan service";

/// One request seen while loading the page
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedResource {
    pub url: Url,
    pub host: String,
    pub transfer_size: u64,
    pub content_size: u64,
    pub origin_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawScan {
    pub resources: Vec<ScannedResource>,
    /// Observed cookie names; not used by the emission model
    pub cookies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    resources: HashMap<String, ResourceEntry>,
    #[serde(default)]
    cookies: Vec<CookieEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceEntry {
    transfer_size: u64,
    #[serde(default)]
    content_size: Option<u64>,
    #[serde(default, rename = "originIP")]
    origin_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CookieEntry {
    Name(String),
    Cookie { name: String },
}

impl TryFrom<ScanResponse> for RawScan {
    type Error = Error;

    fn try_from(response: ScanResponse) -> Result<Self> {
        let mut resources = Vec::with_capacity(response.resources.len());
        for (raw_url, entry) in response.resources {
            let url = Url::parse(&raw_url)
                .map_err(|e| Error::upstream(SERVICE, format!("invalid resource URL '{}': {}", raw_url, e)))?;
            let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
                // data: and blob: URLs never hit the network
                debug!("skipping host-less resource {}", raw_url);
                continue;
            };
            let origin_ip = match entry.origin_ip.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(ip) => Some(ip.trim_matches(|c: char| c == '[' || c == ']').parse::<IpAddr>().map_err(|_| {
                    Error::upstream(SERVICE, format!("invalid origin IP '{}' for {}", ip, raw_url))
                })?),
            };
            resources.push(ScannedResource {
                url,
                host,
                transfer_size: entry.transfer_size,
                content_size: entry.content_size.unwrap_or(entry.transfer_size),
                origin_ip,
            });
        }
        resources.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));

        let cookies = response
            .cookies
            .into_iter()
            .map(|c| match c {
                CookieEntry::Name(name) | CookieEntry::Cookie { name } => name,
            })
            .collect();

        Ok(RawScan { resources, cookies })
    }
}

/// Decode and validate a scan service body
#[cfg(test)]
fn parse_scan(body: &str) -> Result<RawScan> {
    let response: ScanResponse = serde_json::from_str(body)
        .map_err(|e| Error::upstream(SERVICE, format!("malformed response: {}", e)))?;
    response.try_into()
}

pub struct HttpScanSource {
    client: reqwest::Client,
    endpoint: String,
    retries: u32,
}

impl HttpScanSource {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            endpoint: config.scan_url.clone(),
            retries: config.retries,
        }
    }
}

#[async_trait]
impl ScanSource for HttpScanSource {
    async fn scan(&self, url: &Url) -> Result<RawScan> {
        info!("Requesting scan of {}", url);
        let response: ScanResponse = with_retries(SERVICE, self.retries, || {
            fetch_json(
                SERVICE,
                self.client.get(&self.endpoint).query(&[("url", url.as_str())]),
            )
        })
        .await?;
        let scan = RawScan::try_from(response)?;
        info!("Scan of {} returned {} resources", url, scan.resources.len());
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resources_and_cookies() {
        let body = r#"{
            "resources": {
                "https://example.com/": {"transferSize": 12000, "contentSize": 40000, "originIP": "93.184.216.34"},
                "https://cdn.Example.net/app.js": {"transferSize": 5000, "originIP": "[2606:2800:220:1::248]"},
                "data:image/png;base64,AAAA": {"transferSize": 0}
            },
            "cookies": ["_ga", {"name": "session", "value": "x"}]
        }"#;
        let scan = parse_scan(body).unwrap();
        assert_eq!(scan.resources.len(), 2);

        let cdn = &scan.resources[0];
        assert_eq!(cdn.host, "cdn.example.net");
        assert_eq!(cdn.content_size, 5000);
        assert!(matches!(cdn.origin_ip, Some(IpAddr::V6(_))));

        let page = &scan.resources[1];
        assert_eq!(page.transfer_size, 12000);
        assert_eq!(page.content_size, 40000);
        assert_eq!(scan.cookies, vec!["_ga".to_string(), "session".to_string()]);
    }

    #[test]
    fn rejects_negative_sizes() {
        let body = r#"{"resources": {"https://example.com/": {"transferSize": -1}}}"#;
        assert!(matches!(parse_scan(body), Err(Error::Upstream { .. })));
    }

    #[test]
    fn rejects_garbage_ips() {
        let body = r#"{"resources": {"https://example.com/": {"transferSize": 10, "originIP": "not-an-ip"}}}"#;
        assert!(matches!(parse_scan(body), Err(Error::Upstream { .. })));
    }

    #[test]
    fn missing_ip_is_allowed() {
        let body = r#"{"resources": {"https://example.com/": {"transferSize": 10, "originIP": ""}}}"#;
        let scan = parse_scan(body).unwrap();
        assert_eq!(scan.resources[0].origin_ip, None);
    }
}
