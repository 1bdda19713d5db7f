//! Domain entities shared by the estimation pipeline

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// One network request observed while scanning a website
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrace {
    pub url: String,
    pub host: String,
    /// Bytes on the wire
    pub transfer_size: u64,
    /// Decoded bytes
    pub content_size: u64,
    pub origin_ip: Option<String>,
    pub country_code: Option<String>,
    pub green: bool,
}

/// The current resource set of a website
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub website_id: i64,
    pub generation: String,
    pub updated_at: DateTime<Utc>,
    pub resources: Vec<ResourceTrace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Website {
    pub id: i64,
    pub domain: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded pageview, reduced to what the estimates need
#[derive(Debug, Clone, Serialize)]
pub struct Pageview {
    pub website_id: i64,
    pub visitor_id: String,
    pub country_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A calendar month, the resolution at which intensities are predicted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    /// 1..=12
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> crate::error::Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::validation(format!("month must be 1-12, got {}", month)));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: DateTime<Utc>) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Signed number of months from `self` to `other`
    pub fn months_until(&self, other: &YearMonth) -> i64 {
        (other.year as i64 - self.year as i64) * 12 + (other.month as i64 - self.month as i64)
    }

    pub fn days_in_month(&self) -> u32 {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        match (
            NaiveDate::from_ymd_opt(self.year, self.month, 1),
            NaiveDate::from_ymd_opt(next_year, next_month, 1),
        ) {
            (Some(start), Some(end)) => (end - start).num_days() as u32,
            _ => 30,
        }
    }
}

/// A measured annual grid intensity, dated at the start of the measured period
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntensityPoint {
    pub at: YearMonth,
    /// gCO2/kWh
    pub value: f64,
}

/// A dated climate policy milestone attached to a country's series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDeadline {
    pub label: String,
    pub date: NaiveDate,
}

/// Historical intensity of one country, most recent point first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridIntensitySeries {
    /// ISO 3166-1 alpha-2
    pub country_code: String,
    pub points: Vec<IntensityPoint>,
    pub latest_year: Option<i32>,
    pub deadlines: Vec<PolicyDeadline>,
}

impl GridIntensitySeries {
    pub fn new(country_code: impl Into<String>, mut points: Vec<IntensityPoint>) -> Self {
        points.sort_by(|a, b| b.at.cmp(&a.at));
        let latest_year = points.first().map(|p| p.at.year);
        Self {
            country_code: country_code.into(),
            points,
            latest_year,
            deadlines: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&IntensityPoint> {
        self.points.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictedIntensity {
    pub country_code: String,
    pub value: f64,
    pub target: YearMonth,
    pub latest_year: Option<i32>,
    pub deadlines: Vec<PolicyDeadline>,
}

/// Visit counts in a trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VisitAggregate {
    pub total_visits: u64,
    pub distinct_visitors: u64,
}

impl VisitAggregate {
    pub fn from_pageviews(pageviews: &[Pageview]) -> Self {
        let distinct: std::collections::HashSet<&str> =
            pageviews.iter().map(|p| p.visitor_id.as_str()).collect();
        Self {
            total_visits: pageviews.len() as u64,
            distinct_visitors: distinct.len() as u64,
        }
    }

    /// `1 - distinct / total`; `None` when there were no visits
    pub fn first_visit_percentage(&self) -> Option<f64> {
        if self.total_visits == 0 {
            return None;
        }
        Some(1.0 - self.distinct_visitors as f64 / self.total_visits as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateMode {
    Pageview,
    Yearly,
}

impl FromStr for EstimateMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pageview" => Ok(Self::Pageview),
            "yearly" => Ok(Self::Yearly),
            other => Err(Error::validation(format!(
                "invalid mode '{}', expected 'pageview' or 'yearly'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmissionEstimate {
    pub domains: usize,
    pub green_domains: usize,
    /// gCO2e
    pub emission: f64,
}
