//! Database module

mod schema;
mod write_buffer;

pub use write_buffer::{start_write_buffer, PageviewSender};

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::model::{Pageview, ResourceTrace, Scan, Website};

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

type WebsiteRow = (i64, String, String, i64, i64);

fn website_from_row((id, domain, url, created_at, updated_at): WebsiteRow) -> Website {
    Website {
        id,
        domain,
        url,
        created_at: from_millis(created_at),
        updated_at: from_millis(updated_at),
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection so every query sees the same data
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        for statement in [
            schema::CREATE_WEBSITES_TABLE,
            schema::CREATE_SCANS_TABLE,
            schema::CREATE_RESOURCES_TABLE,
            schema::CREATE_PAGEVIEWS_TABLE,
            schema::CREATE_INDEX_RESOURCES_WEBSITE,
            schema::CREATE_INDEX_PAGEVIEWS_WEBSITE_TS,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_website(&self, domain: &str, url: &str, now: DateTime<Utc>) -> Result<Website> {
        let result = sqlx::query(
            "INSERT INTO websites (domain, url, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(domain)
        .bind(url)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => {
                Error::validation(format!("website {} is already registered", domain))
            }
            _ => Error::Database(e),
        })?;

        Ok(Website {
            id: result.last_insert_rowid(),
            domain: domain.to_string(),
            url: url.to_string(),
            created_at: from_millis(now.timestamp_millis()),
            updated_at: from_millis(now.timestamp_millis()),
        })
    }

    pub async fn get_website(&self, id: i64) -> Result<Option<Website>> {
        let row: Option<WebsiteRow> = sqlx::query_as(
            "SELECT id, domain, url, created_at, updated_at FROM websites WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(website_from_row))
    }

    pub async fn find_website_by_domain(&self, domain: &str) -> Result<Option<Website>> {
        let row: Option<WebsiteRow> = sqlx::query_as(
            "SELECT id, domain, url, created_at, updated_at FROM websites WHERE domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(website_from_row))
    }

    /// Last-updated times of the stored scans of a website
    pub async fn scan_timestamps(&self, website_id: i64) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT updated_at FROM scans WHERE website_id = ?")
            .bind(website_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(ms,)| from_millis(ms)).collect())
    }

    /// The current scan of a website, if one was ever taken
    pub async fn load_scan(&self, website_id: i64) -> Result<Option<Scan>> {
        let head: Option<(String, i64)> =
            sqlx::query_as("SELECT generation, updated_at FROM scans WHERE website_id = ?")
                .bind(website_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((generation, updated_at)) = head else {
            return Ok(None);
        };

        let rows: Vec<(String, String, i64, i64, Option<String>, Option<String>, bool)> = sqlx::query_as(
            r#"
            SELECT url, host, transfer_size, content_size, origin_ip, country_code, green
            FROM resources
            WHERE website_id = ? AND generation = ?
            ORDER BY id
            "#,
        )
        .bind(website_id)
        .bind(&generation)
        .fetch_all(&self.pool)
        .await?;

        let resources = rows
            .into_iter()
            .map(|(url, host, transfer_size, content_size, origin_ip, country_code, green)| ResourceTrace {
                url,
                host,
                transfer_size: transfer_size.max(0) as u64,
                content_size: content_size.max(0) as u64,
                origin_ip,
                country_code,
                green,
            })
            .collect();

        Ok(Some(Scan {
            website_id,
            generation,
            updated_at: from_millis(updated_at),
            resources,
        }))
    }

    /// Atomically replace a website's resource set.
    ///
    /// New rows are written under a fresh generation, every other generation
    /// is deleted and the scan pointer is flipped, all in one transaction.
    pub async fn replace_scan(
        &self,
        website_id: i64,
        resources: &[ResourceTrace],
        now: DateTime<Utc>,
    ) -> Result<Scan> {
        let generation = uuid::Uuid::new_v4().to_string();
        let at = now.timestamp_millis();

        let mut tx = self.pool.begin().await?;
        for r in resources {
            sqlx::query(
                r#"
                INSERT INTO resources (website_id, generation, url, host, transfer_size, content_size, origin_ip, country_code, green, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(website_id)
            .bind(&generation)
            .bind(&r.url)
            .bind(&r.host)
            .bind(r.transfer_size as i64)
            .bind(r.content_size as i64)
            .bind(&r.origin_ip)
            .bind(&r.country_code)
            .bind(r.green)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(|e| refresh_error(website_id, e))?;
        }

        let deleted = sqlx::query("DELETE FROM resources WHERE website_id = ? AND generation != ?")
            .bind(website_id)
            .bind(&generation)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO scans (website_id, generation, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(website_id) DO UPDATE SET generation = excluded.generation, updated_at = excluded.updated_at
            "#,
        )
        .bind(website_id)
        .bind(&generation)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(|e| refresh_error(website_id, e))?;

        tx.commit().await?;
        info!(
            "Replaced scan of website {}: {} resources in, {} out",
            website_id,
            resources.len(),
            deleted
        );

        Ok(Scan {
            website_id,
            generation,
            updated_at: from_millis(at),
            resources: resources.to_vec(),
        })
    }

    /// Insert a batch of pageviews in a single transaction
    pub async fn batch_insert_pageviews(&self, pageviews: &[Pageview]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for pageview in pageviews {
            sqlx::query(
                "INSERT INTO pageviews (website_id, visitor_id, country_code, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(pageview.website_id)
            .bind(&pageview.visitor_id)
            .bind(&pageview.country_code)
            .bind(pageview.timestamp.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Pageviews of a website at or after `since`, oldest first
    pub async fn pageviews_since(&self, website_id: i64, since: DateTime<Utc>) -> Result<Vec<Pageview>> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT visitor_id, country_code, timestamp
            FROM pageviews
            WHERE website_id = ? AND timestamp >= ?
            ORDER BY timestamp
            "#,
        )
        .bind(website_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(visitor_id, country_code, ts)| Pageview {
                website_id,
                visitor_id,
                country_code,
                timestamp: from_millis(ts),
            })
            .collect())
    }
}

/// A vanished parent row means the website changed under a concurrent refresh
fn refresh_error(website_id: i64, e: sqlx::Error) -> Error {
    match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => Error::RefreshConflict(website_id),
        _ => Error::Database(e),
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    let db = Database::in_memory().await.unwrap();
    db.run_migrations().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trace(url: &str, host: &str, bytes: u64, green: bool) -> ResourceTrace {
        ResourceTrace {
            url: url.to_string(),
            host: host.to_string(),
            transfer_size: bytes,
            content_size: bytes * 2,
            origin_ip: Some("93.184.216.34".to_string()),
            country_code: Some("US".to_string()),
            green,
        }
    }

    #[tokio::test]
    async fn registers_and_finds_websites() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db.insert_website("example.com", "https://example.com/", now).await.unwrap();
        assert_eq!(db.get_website(site.id).await.unwrap().unwrap().domain, "example.com");
        assert_eq!(db.find_website_by_domain("example.com").await.unwrap().unwrap().id, site.id);
        assert!(db.get_website(site.id + 100).await.unwrap().is_none());

        let duplicate = db.insert_website("example.com", "https://example.com/", now).await;
        assert!(matches!(duplicate, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn replace_scan_drops_previous_resources() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db.insert_website("example.com", "https://example.com/", now).await.unwrap();
        assert!(db.load_scan(site.id).await.unwrap().is_none());

        let first = vec![
            trace("https://example.com/", "example.com", 1000, false),
            trace("https://ads.example.net/tag.js", "ads.example.net", 9000, false),
        ];
        db.replace_scan(site.id, &first, now).await.unwrap();
        assert_eq!(db.load_scan(site.id).await.unwrap().unwrap().resources.len(), 2);

        // The ad script was removed from the site
        let second = vec![trace("https://example.com/", "example.com", 1200, true)];
        let later = now + Duration::days(15);
        let scan = db.replace_scan(site.id, &second, later).await.unwrap();

        let loaded = db.load_scan(site.id).await.unwrap().unwrap();
        assert_eq!(loaded.generation, scan.generation);
        assert_eq!(loaded.resources, second);
        assert_eq!(db.scan_timestamps(site.id).await.unwrap().len(), 1);

        let (leftover,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resources")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(leftover, 1);
    }

    #[tokio::test]
    async fn replacing_scan_of_missing_website_is_a_conflict() {
        let db = test_db().await;
        let result = db
            .replace_scan(42, &[trace("https://gone.example/", "gone.example", 10, false)], Utc::now())
            .await;
        assert!(matches!(result, Err(Error::RefreshConflict(42))));
    }

    #[tokio::test]
    async fn pageview_window_is_inclusive_and_ordered() {
        let db = test_db().await;
        let now = Utc::now();
        let site = db.insert_website("example.com", "https://example.com/", now).await.unwrap();
        let views: Vec<Pageview> = [40, 20, 5, 0]
            .iter()
            .map(|days| Pageview {
                website_id: site.id,
                visitor_id: format!("v{}", days),
                country_code: Some("DE".to_string()),
                timestamp: now - Duration::days(*days),
            })
            .collect();
        db.batch_insert_pageviews(&views).await.unwrap();

        let recent = db.pageviews_since(site.id, now - Duration::days(30)).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|p| p.visitor_id.as_str()).collect();
        assert_eq!(ids, vec!["v20", "v5", "v0"]);
    }
}
