//! Scan freshness policy and refresh
//!
//! A stored scan is reused until both the website record and every stored
//! scan are older than the staleness window. Refreshing replaces the whole
//! resource set. Refreshes of one website are serialized in-process and the
//! replace itself is a single transaction.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};
use url::Url;

use crate::aggregate::collect_resources;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{Scan, Website};
use crate::upstream::{GreenClassifier, IpCountryResolver, ScanSource};

#[derive(Debug, Clone, Copy)]
pub struct StalenessPolicy {
    threshold: Duration,
}

impl StalenessPolicy {
    pub fn new(stale_after_days: i64) -> Self {
        Self {
            threshold: Duration::days(stale_after_days),
        }
    }

    /// Stale when there are no scans, or when the website and all of its
    /// scans were last updated before the window.
    pub fn is_stale(
        &self,
        website_updated_at: DateTime<Utc>,
        scan_updated_at: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> bool {
        if scan_updated_at.is_empty() {
            return true;
        }
        let cutoff = now - self.threshold;
        website_updated_at < cutoff && scan_updated_at.iter().all(|at| *at < cutoff)
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::new(14)
    }
}

/// Everything needed to turn a URL into a classified resource set
#[derive(Clone)]
pub struct Scanner {
    pub source: Arc<dyn ScanSource>,
    pub resolver: Arc<dyn IpCountryResolver>,
    pub classifier: Arc<dyn GreenClassifier>,
}

impl Scanner {
    pub async fn scan(&self, url: &str) -> Result<Vec<crate::model::ResourceTrace>> {
        let url = Url::parse(url).map_err(|e| Error::validation(format!("invalid URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation(format!("unsupported URL scheme '{}'", url.scheme())));
        }
        let raw = self.source.scan(&url).await?;
        collect_resources(&raw, self.resolver.as_ref(), self.classifier.as_ref()).await
    }
}

/// Held for the duration of one refresh; forgets the website's lock once
/// nobody else is waiting on it
struct WebsiteLock<'a> {
    locks: &'a Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    website_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for WebsiteLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Waiters clone the Arc under this map lock, so a count of one is final
        if locks.get(&self.website_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.website_id);
        }
    }
}

pub struct ScanRefresher {
    db: Database,
    scanner: Scanner,
    policy: StalenessPolicy,
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl ScanRefresher {
    pub fn new(db: Database, scanner: Scanner, policy: StalenessPolicy) -> Self {
        Self {
            db,
            scanner,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    async fn lock(&self, website_id: i64) -> WebsiteLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(website_id).or_default().clone()
        };
        WebsiteLock {
            locks: &self.locks,
            website_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// The website's scan, rescanned first if the stored one is stale
    pub async fn current_scan(&self, website: &Website, now: DateTime<Utc>) -> Result<Scan> {
        let _guard = self.lock(website.id).await;

        let timestamps = self.db.scan_timestamps(website.id).await?;
        if !self.policy.is_stale(website.updated_at, &timestamps, now) {
            if let Some(scan) = self.db.load_scan(website.id).await? {
                debug!("Reusing scan {} of website {}", scan.generation, website.id);
                return Ok(scan);
            }
        }
        self.refresh_locked(website, now).await
    }

    /// Rescan regardless of staleness; authorization is the caller's job
    pub async fn force_refresh(&self, website: &Website, now: DateTime<Utc>) -> Result<Scan> {
        let _guard = self.lock(website.id).await;
        self.refresh_locked(website, now).await
    }

    async fn refresh_locked(&self, website: &Website, now: DateTime<Utc>) -> Result<Scan> {
        info!("Refreshing scan of {} (website {})", website.url, website.id);
        let resources = self.scanner.scan(&website.url).await?;
        self.db.replace_scan(website.id, &resources, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::scanned;
    use crate::db::test_db;
    use crate::upstream::fakes::{FailingUpstream, FakeGreenClassifier, FakeIpResolver, FakeScanSource};
    use crate::upstream::RawScan;
    use std::sync::atomic::Ordering;

    fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        now - Duration::days(days)
    }

    #[test]
    fn recent_scan_keeps_old_website_fresh() {
        let now = Utc::now();
        let policy = StalenessPolicy::default();
        assert!(!policy.is_stale(days_ago(now, 20), &[days_ago(now, 10)], now));
    }

    #[test]
    fn no_scans_is_always_stale() {
        let now = Utc::now();
        let policy = StalenessPolicy::default();
        assert!(policy.is_stale(now, &[], now));
    }

    #[test]
    fn everything_old_is_stale() {
        let now = Utc::now();
        let policy = StalenessPolicy::default();
        assert!(policy.is_stale(days_ago(now, 20), &[days_ago(now, 15), days_ago(now, 30)], now));
        // A recently touched website record is enough to reuse
        assert!(!policy.is_stale(days_ago(now, 1), &[days_ago(now, 30)], now));
        // One fresh scan among old ones is enough too
        assert!(!policy.is_stale(days_ago(now, 20), &[days_ago(now, 30), days_ago(now, 2)], now));
    }

    fn scanner_for(url: &str) -> (Arc<FakeScanSource>, Scanner) {
        let source = Arc::new(FakeScanSource {
            scans: HashMap::from([(
                url.to_string(),
                RawScan {
                    resources: vec![scanned(url, 50_000, Some("93.184.216.34"))],
                    cookies: vec![],
                },
            )]),
            ..Default::default()
        });
        let scanner = Scanner {
            source: source.clone(),
            resolver: Arc::new(FakeIpResolver::default()),
            classifier: Arc::new(FakeGreenClassifier::default()),
        };
        (source, scanner)
    }

    #[tokio::test]
    async fn stale_website_is_rescanned_once() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db
            .insert_website("example.com", "https://example.com/", days_ago(now, 30))
            .await
            .unwrap();
        let (source, scanner) = scanner_for("https://example.com/");
        let refresher = Arc::new(ScanRefresher::new(db.clone(), scanner, StalenessPolicy::default()));

        let (a, b) = tokio::join!(refresher.current_scan(&site, now), refresher.current_scan(&site, now));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.generation, b.generation);
        assert_eq!(a.resources.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(refresher.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forced_refresh_ignores_freshness() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db.insert_website("example.com", "https://example.com/", now).await.unwrap();
        let (source, scanner) = scanner_for("https://example.com/");
        let refresher = ScanRefresher::new(db.clone(), scanner, StalenessPolicy::default());

        let first = refresher.current_scan(&site, now).await.unwrap();
        let reused = refresher.current_scan(&site, now).await.unwrap();
        assert_eq!(first.generation, reused.generation);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let forced = refresher.force_refresh(&site, now).await.unwrap();
        assert_ne!(forced.generation, first.generation);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(refresher.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_aborts_refresh() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db.insert_website("example.com", "https://example.com/", now).await.unwrap();
        let scanner = Scanner {
            source: Arc::new(FailingUpstream),
            resolver: Arc::new(FakeIpResolver::default()),
            classifier: Arc::new(FakeGreenClassifier::default()),
        };
        let refresher = ScanRefresher::new(db.clone(), scanner, StalenessPolicy::default());
        let result = refresher.current_scan(&site, now).await;
        assert!(matches!(result, Err(Error::Upstream { .. })));
        assert!(db.load_scan(site.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let (_, scanner) = scanner_for("https://example.com/");
        assert!(matches!(scanner.scan("ftp://example.com/").await, Err(Error::Validation(_))));
        assert!(matches!(scanner.scan("not a url").await, Err(Error::Validation(_))));
    }
}
