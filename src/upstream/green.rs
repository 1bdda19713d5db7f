//! Green hosting classification with a hostname-keyed TTL cache

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

use super::{fetch_json, with_retries, GreenClassifier};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

const SERVICE: &str = "green classifier";

#[derive(Debug, Deserialize)]
struct GreenEntry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    green: bool,
}

/// Hosts the classifier confirmed green, restricted to the ones we asked about
fn green_subset(entries: HashMap<String, GreenEntry>, hosts: &[String]) -> HashSet<String> {
    entries
        .into_iter()
        .filter(|(_, entry)| entry.green)
        .map(|(key, entry)| entry.url.unwrap_or(key).to_ascii_lowercase())
        .filter(|host| hosts.contains(host))
        .collect()
}

pub struct HttpGreenClassifier {
    client: reqwest::Client,
    endpoint: url::Url,
    retries: u32,
}

impl HttpGreenClassifier {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client,
            endpoint: url::Url::parse(&config.green_url)?,
            retries: config.retries,
        })
    }

    /// `{endpoint}/["a.com","b.com"]`
    fn multi_url(&self, hosts: &[String]) -> Result<url::Url> {
        let list = serde_json::to_string(hosts).map_err(|e| Error::upstream(SERVICE, e))?;
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::upstream(SERVICE, "endpoint cannot take a path"))?
            .pop_if_empty()
            .push(&list);
        Ok(url)
    }
}

#[async_trait]
impl GreenClassifier for HttpGreenClassifier {
    async fn green_hosts(&self, hosts: &[String]) -> Result<HashSet<String>> {
        if hosts.is_empty() {
            return Ok(HashSet::new());
        }
        let url = self.multi_url(hosts)?;
        let entries: HashMap<String, GreenEntry> = with_retries(SERVICE, self.retries, || {
            fetch_json(SERVICE, self.client.get(url.clone()))
        })
        .await?;
        Ok(green_subset(entries, hosts))
    }
}

/// Answers from memory when a host was classified within the TTL, asking the
/// inner classifier only about the rest. Negative answers are cached too.
pub struct CachedGreenClassifier<C> {
    inner: C,
    cache: Mutex<TimedCache<String, bool>>,
}

impl<C: GreenClassifier> CachedGreenClassifier<C> {
    pub fn new(inner: C, ttl_secs: u64) -> Self {
        Self {
            inner,
            cache: Mutex::new(TimedCache::with_lifespan(ttl_secs)),
        }
    }
}

#[async_trait]
impl<C: GreenClassifier> GreenClassifier for CachedGreenClassifier<C> {
    async fn green_hosts(&self, hosts: &[String]) -> Result<HashSet<String>> {
        let mut green = HashSet::new();
        let mut misses = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for host in hosts {
                match cache.cache_get(host).copied() {
                    Some(true) => {
                        green.insert(host.clone());
                    }
                    Some(false) => {}
                    None => misses.push(host.clone()),
                }
            }
        }
        debug!(
            "Green cache: {} hits, {} misses",
            hosts.len() - misses.len(),
            misses.len()
        );
        if misses.is_empty() {
            return Ok(green);
        }

        let fresh = self.inner.green_hosts(&misses).await?;
        let mut cache = self.cache.lock().await;
        for host in misses {
            let is_green = fresh.contains(&host);
            cache.cache_set(host.clone(), is_green);
            if is_green {
                green.insert(host);
            }
        }
        Ok(green)
    }
}
