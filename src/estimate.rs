//! One estimation request, from stored website to emission figure

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

use crate::db::Database;
use crate::emission::{self, IntensityTable, PageCalculation};
use crate::error::{Error, Result};
use crate::model::{EmissionEstimate, EstimateMode, PredictedIntensity, ResourceTrace, YearMonth};
use crate::predict::{global_average, predict_intensities};
use crate::refresh::ScanRefresher;
use crate::upstream::IntensitySource;

#[derive(Debug, Clone, Serialize)]
pub struct IntensityReport {
    pub predicted: BTreeMap<String, PredictedIntensity>,
    /// Average of the latest known values over all countries
    pub global: Option<f64>,
}

pub struct Estimator {
    db: Database,
    refresher: Arc<ScanRefresher>,
    intensity: Arc<dyn IntensitySource>,
    window: Duration,
}

fn resource_countries(resources: &[ResourceTrace]) -> BTreeSet<String> {
    resources.iter().filter_map(|r| r.country_code.clone()).collect()
}

impl Estimator {
    pub fn new(
        db: Database,
        refresher: Arc<ScanRefresher>,
        intensity: Arc<dyn IntensitySource>,
        pageview_window_days: i64,
    ) -> Self {
        Self {
            db,
            refresher,
            intensity,
            window: Duration::days(pageview_window_days),
        }
    }

    pub fn refresher(&self) -> &ScanRefresher {
        &self.refresher
    }

    /// Predictions for `countries` plus the global fallback
    pub async fn intensities(&self, countries: &BTreeSet<String>, target: YearMonth) -> Result<IntensityReport> {
        let predicted = if countries.is_empty() {
            BTreeMap::new()
        } else {
            let requested: Vec<String> = countries.iter().cloned().collect();
            let series = self.intensity.series(&requested).await?;
            predict_intensities(&series, target)
        };
        let global = global_average(&self.intensity.series(&[]).await?);
        Ok(IntensityReport { predicted, global })
    }

    async fn intensity_table(&self, countries: &BTreeSet<String>, target: YearMonth) -> Result<IntensityTable> {
        let report = self.intensities(countries, target).await?;
        let fallback = report
            .global
            .ok_or_else(|| Error::upstream("intensity source", "no intensity data available"))?;
        Ok(IntensityTable::new(&report.predicted, fallback))
    }

    pub async fn estimate(&self, website_id: i64, mode: EstimateMode, now: DateTime<Utc>) -> Result<EmissionEstimate> {
        let website = self
            .db
            .get_website(website_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("website {}", website_id)))?;
        let scan = self.refresher.current_scan(&website, now).await?;
        let target = YearMonth::of(now);

        let estimate = match mode {
            EstimateMode::Pageview => {
                let table = self.intensity_table(&resource_countries(&scan.resources), target).await?;
                emission::estimate_pageview(&scan.resources, &table)
            }
            EstimateMode::Yearly => {
                let pageviews = self.db.pageviews_since(website.id, now - self.window).await?;
                if pageviews.is_empty() {
                    // Nothing observed, nothing to extrapolate
                    let empty = IntensityTable::from_values([], 0.0);
                    emission::estimate_yearly(&scan.resources, &empty, &[], target)
                } else {
                    let mut countries = resource_countries(&scan.resources);
                    countries.extend(pageviews.iter().filter_map(|p| p.country_code.clone()));
                    let table = self.intensity_table(&countries, target).await?;
                    emission::estimate_yearly(&scan.resources, &table, &pageviews, target)
                }
            }
        };

        info!(
            "Estimated {:?} emission for website {}: {:.4} g ({} domains, {} green)",
            mode, website.id, estimate.emission, estimate.domains, estimate.green_domains
        );
        Ok(estimate)
    }

    /// Cost an arbitrary URL without storing the scan
    pub async fn calculate(&self, url: &str, now: DateTime<Utc>) -> Result<PageCalculation> {
        let resources = self.refresher.scanner().scan(url).await?;
        let table = self
            .intensity_table(&resource_countries(&resources), YearMonth::of(now))
            .await?;
        Ok(emission::calculate_page(&resources, &table))
    }
}
