//! Batch IP geolocation for resource origin addresses

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

use super::{fetch_json, with_retries, IpCountryResolver};
use crate::config::UpstreamConfig;
use crate::countries;
use crate::error::Result;

const SERVICE: &str = "IP geolocation";

/// Upper bound on queries per batch request
const BATCH_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
struct BatchQuery {
    query: String,
    fields: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchAnswer {
    query: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
}

/// Keep answers that name a queried IP and a real country
fn collect_answers(answers: Vec<BatchAnswer>, asked: &[IpAddr]) -> HashMap<IpAddr, String> {
    answers
        .into_iter()
        .filter(|a| a.status.as_deref().map_or(true, |s| s == "success"))
        .filter_map(|a| {
            let ip: IpAddr = a.query.parse().ok()?;
            if !asked.contains(&ip) {
                debug!("ignoring unrequested answer for {}", ip);
                return None;
            }
            let country = countries::normalize_alpha2(a.country_code.as_deref()?)?;
            Some((ip, country.to_string()))
        })
        .collect()
}

pub struct HttpIpResolver {
    client: reqwest::Client,
    endpoint: String,
    retries: u32,
}

impl HttpIpResolver {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            endpoint: config.ip_batch_url.clone(),
            retries: config.retries,
        }
    }
}

#[async_trait]
impl IpCountryResolver for HttpIpResolver {
    async fn resolve(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, String>> {
        let mut resolved = HashMap::with_capacity(ips.len());
        for chunk in ips.chunks(BATCH_LIMIT) {
            let body: Vec<BatchQuery> = chunk
                .iter()
                .map(|ip| BatchQuery {
                    query: ip.to_string(),
                    fields: "query,status,countryCode",
                })
                .collect();
            let answers: Vec<BatchAnswer> = with_retries(SERVICE, self.retries, || {
                fetch_json(SERVICE, self.client.post(&self.endpoint).json(&body))
            })
            .await?;
            resolved.extend(collect_answers(answers, chunk));
        }
        debug!("Resolved {}/{} origin IPs", resolved.len(), ips.len());
        Ok(resolved)
    }
}
