//! National grid carbon intensity data

use async_trait::async_trait;
use cached::{Cached, TimedCache};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{fetch_json, with_retries, IntensitySource};
use crate::config::UpstreamConfig;
use crate::countries;
use crate::error::{Error, Result};
use crate::model::{GridIntensitySeries, IntensityPoint, PolicyDeadline, YearMonth};

const SERVICE: &str = "intensity source";

/// One (country, year) measurement. Country codes are alpha-3.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntensityRow {
    country_code: String,
    year: i32,
    intensity: f64,
    #[serde(default)]
    latest_year: Option<i32>,
    /// Named policy dates, e.g. `{"coalPhaseOut": "2038-12-31"}`
    #[serde(default)]
    deadlines: HashMap<String, Option<String>>,
}

fn validate_row(row: &IntensityRow) -> Result<()> {
    if !(1900..=2200).contains(&row.year) {
        return Err(Error::upstream(
            SERVICE,
            format!("implausible year {} for {}", row.year, row.country_code),
        ));
    }
    if !row.intensity.is_finite() || row.intensity < 0.0 {
        return Err(Error::upstream(
            SERVICE,
            format!("invalid intensity {} for {} {}", row.intensity, row.country_code, row.year),
        ));
    }
    Ok(())
}

/// Group validated rows into one series per alpha-2 country.
/// Rows for codes that aren't countries (regional aggregates) are dropped.
fn rows_to_series(rows: Vec<IntensityRow>) -> Result<Vec<GridIntensitySeries>> {
    let mut grouped: BTreeMap<&'static str, (Vec<IntensityPoint>, Option<i32>, Vec<PolicyDeadline>)> =
        BTreeMap::new();

    for row in rows {
        validate_row(&row)?;
        let Some(alpha2) = countries::alpha2(&row.country_code) else {
            debug!("skipping intensity row for non-country code {}", row.country_code);
            continue;
        };
        let entry = grouped.entry(alpha2).or_default();
        entry.0.push(IntensityPoint {
            at: YearMonth { year: row.year, month: 1 },
            value: row.intensity,
        });
        entry.1 = entry.1.max(row.latest_year);

        for (label, date) in row.deadlines {
            let Some(date) = date else { continue };
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
                Error::upstream(SERVICE, format!("invalid {} date '{}' for {}", label, date, alpha2))
            })?;
            if !entry.2.iter().any(|d| d.label == label) {
                entry.2.push(PolicyDeadline { label, date });
            }
        }
    }

    Ok(grouped
        .into_iter()
        .map(|(alpha2, (points, latest_year, mut deadlines))| {
            let mut series = GridIntensitySeries::new(alpha2, points);
            series.latest_year = series.latest_year.max(latest_year);
            deadlines.sort_by(|a, b| a.date.cmp(&b.date));
            series.deadlines = deadlines;
            series
        })
        .collect())
}

#[cfg(test)]
fn parse_intensity(body: &str) -> Result<Vec<GridIntensitySeries>> {
    let rows: Vec<IntensityRow> = serde_json::from_str(body)
        .map_err(|e| Error::upstream(SERVICE, format!("malformed response: {}", e)))?;
    rows_to_series(rows)
}

pub struct HttpIntensitySource {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retries: u32,
}

impl HttpIntensitySource {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            endpoint: config.intensity_url.clone(),
            api_key: Some(config.intensity_api_key.clone()).filter(|k| !k.is_empty()),
            retries: config.retries,
        }
    }

    fn request(&self, alpha3: &[&str]) -> reqwest::RequestBuilder {
        let mut request = self.client.get(&self.endpoint);
        if !alpha3.is_empty() {
            request = request.query(&[("countries", alpha3.join(","))]);
        }
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }
        request
    }
}

#[async_trait]
impl IntensitySource for HttpIntensitySource {
    async fn series(&self, codes: &[String]) -> Result<Vec<GridIntensitySeries>> {
        let alpha3: Vec<&str> = codes
            .iter()
            .map(|c| {
                countries::alpha3(c).ok_or_else(|| Error::validation(format!("unknown country code '{}'", c)))
            })
            .collect::<Result<_>>()?;

        let rows: Vec<IntensityRow> = with_retries(SERVICE, self.retries, || {
            fetch_json(SERVICE, self.request(&alpha3))
        })
        .await?;
        let series = rows_to_series(rows)?;
        info!("Loaded intensity series for {} countries", series.len());
        Ok(series)
    }
}

/// Keeps fetched series for a while, keyed by the requested country set
pub struct CachedIntensitySource<S> {
    inner: S,
    cache: Mutex<TimedCache<String, Vec<GridIntensitySeries>>>,
}

impl<S: IntensitySource> CachedIntensitySource<S> {
    pub fn new(inner: S, ttl_secs: u64) -> Self {
        Self {
            inner,
            cache: Mutex::new(TimedCache::with_lifespan(ttl_secs)),
        }
    }
}

fn cache_key(countries: &[String]) -> String {
    let mut sorted: Vec<&str> = countries.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.is_empty() {
        "*".to_string()
    } else {
        sorted.join(",")
    }
}

#[async_trait]
impl<S: IntensitySource> IntensitySource for CachedIntensitySource<S> {
    async fn series(&self, countries: &[String]) -> Result<Vec<GridIntensitySeries>> {
        let key = cache_key(countries);
        if let Some(hit) = self.cache.lock().await.cache_get(&key) {
            return Ok(hit.clone());
        }
        let series = self.inner.series(countries).await?;
        self.cache.lock().await.cache_set(key, series.clone());
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fakes::FakeIntensitySource;
    use std::sync::atomic::Ordering;

    #[test]
    fn groups_rows_by_country_and_maps_codes() {
        let body = r#"[
            {"countryCode": "DEU", "year": 2021, "intensity": 380.0, "latestYear": 2022,
             "deadlines": {"coalPhaseOut": "2038-12-31", "netZero": "2045-01-01"}},
            {"countryCode": "DEU", "year": 2022, "intensity": 350.0},
            {"countryCode": "FRA", "year": 2022, "intensity": 56.0, "deadlines": {"coalPhaseOut": null}},
            {"countryCode": "EU27", "year": 2022, "intensity": 250.0}
        ]"#;
        let series = parse_intensity(body).unwrap();
        assert_eq!(series.len(), 2);

        let de = &series[0];
        assert_eq!(de.country_code, "DE");
        assert_eq!(de.points[0].value, 350.0);
        assert_eq!(de.latest_year, Some(2022));
        assert_eq!(de.deadlines.len(), 2);
        assert_eq!(de.deadlines[0].label, "coalPhaseOut");

        assert_eq!(series[1].country_code, "FR");
        assert!(series[1].deadlines.is_empty());
    }

    #[test]
    fn rejects_invalid_measurements() {
        assert!(parse_intensity(r#"[{"countryCode": "DEU", "year": 2022, "intensity": -3.0}]"#).is_err());
        assert!(parse_intensity(r#"[{"countryCode": "DEU", "year": 22, "intensity": 300.0}]"#).is_err());
        assert!(parse_intensity(r#"[{"countryCode": "DEU", "year": 2022}]"#).is_err());
        assert!(parse_intensity(
            r#"[{"countryCode": "DEU", "year": 2022, "intensity": 1.0, "deadlines": {"x": "soon"}}]"#
        )
        .is_err());
    }

    #[test]
    fn cache_key_ignores_order() {
        assert_eq!(cache_key(&["FR".into(), "DE".into(), "FR".into()]), "DE,FR");
        assert_eq!(cache_key(&[]), "*");
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_cache() {
        let fake = FakeIntensitySource {
            series: vec![GridIntensitySeries::new(
                "DE",
                vec![IntensityPoint { at: YearMonth { year: 2022, month: 1 }, value: 350.0 }],
            )],
            ..Default::default()
        };
        let source = CachedIntensitySource::new(fake, 60);
        let countries = vec!["DE".to_string()];
        source.series(&countries).await.unwrap();
        let again = source.series(&countries).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);
    }
}
