//! Emission calculator
//!
//! Per resource: `transfer bytes * kWh/byte * reload factor * blended intensity`.
//! The blended intensity splits energy between the hosting side (the
//! resource's datacenter country, or renewables when green hosted) and the
//! visitor side (the visitor's country when known). All figures are grams
//! CO2e; conversions to kg or tonnes belong to presentation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{EmissionEstimate, Pageview, PredictedIntensity, ResourceTrace, VisitAggregate, YearMonth};

/// Energy per transferred gigabyte
pub const KWH_PER_GB: f64 = 0.75;
/// Share of bytes re-fetched on a returning visit
pub const DATA_RELOAD_RATIO: f64 = 0.089;
/// gCO2/kWh of renewable supply
pub const RENEWABLES_GRID_INTENSITY: f64 = 10.0;
/// Share of a transfer's energy spent on the hosting side
pub const DATACENTER_SHARE: f64 = 0.15;
/// First-visit share assumed for a generic visit
pub const DEFAULT_FIRST_VISIT_PERCENTAGE: f64 = 0.75;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Predicted intensities keyed by alpha-2 code, with a value for everything else
#[derive(Debug, Clone)]
pub struct IntensityTable {
    by_country: HashMap<String, f64>,
    fallback: f64,
}

impl IntensityTable {
    pub fn new(predicted: &BTreeMap<String, PredictedIntensity>, fallback: f64) -> Self {
        Self {
            by_country: predicted
                .iter()
                .map(|(code, p)| (code.clone(), p.value))
                .collect(),
            fallback,
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, f64)>, fallback: f64) -> Self {
        Self {
            by_country: values.into_iter().collect(),
            fallback,
        }
    }

    pub fn known(&self, country: Option<&str>) -> Option<f64> {
        country.and_then(|c| self.by_country.get(c).copied())
    }

    pub fn get(&self, country: Option<&str>) -> f64 {
        self.known(country).unwrap_or(self.fallback)
    }
}

/// Weight of a visit's bytes once cached returning visits are accounted for
pub fn reload_factor(first_visit_percentage: f64) -> f64 {
    let first = first_visit_percentage.clamp(0.0, 1.0);
    first + (1.0 - first) * DATA_RELOAD_RATIO
}

/// Emission of one resource on one visit
pub fn resource_emission(
    transfer_bytes: u64,
    green: bool,
    datacenter_intensity: f64,
    device_intensity: Option<f64>,
    first_visit_percentage: f64,
) -> f64 {
    let hosting = if green {
        RENEWABLES_GRID_INTENSITY.min(datacenter_intensity)
    } else {
        datacenter_intensity
    };
    let device = device_intensity.unwrap_or(datacenter_intensity);
    let blended = DATACENTER_SHARE * hosting + (1.0 - DATACENTER_SHARE) * device;

    let kwh = transfer_bytes as f64 * KWH_PER_GB / BYTES_PER_GB;
    kwh * reload_factor(first_visit_percentage) * blended
}

/// Emission of one visit over the whole resource set
pub fn visit_emission(
    resources: &[ResourceTrace],
    intensities: &IntensityTable,
    visitor_country: Option<&str>,
    first_visit_percentage: f64,
) -> f64 {
    let device = intensities.known(visitor_country);
    resources
        .iter()
        .map(|r| {
            resource_emission(
                r.transfer_size,
                r.green,
                intensities.get(r.country_code.as_deref()),
                device,
                first_visit_percentage,
            )
        })
        .sum()
}

fn domain_counts(resources: &[ResourceTrace]) -> (usize, usize) {
    let hosts: HashSet<&str> = resources.iter().map(|r| r.host.as_str()).collect();
    let green: HashSet<&str> = resources
        .iter()
        .filter(|r| r.green)
        .map(|r| r.host.as_str())
        .collect();
    (hosts.len(), green.len())
}

/// A single generic visit: hosting side only, default first-visit share
pub fn estimate_pageview(resources: &[ResourceTrace], intensities: &IntensityTable) -> EmissionEstimate {
    let (domains, green_domains) = domain_counts(resources);
    EmissionEstimate {
        domains,
        green_domains,
        emission: visit_emission(resources, intensities, None, DEFAULT_FIRST_VISIT_PERCENTAGE),
    }
}

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Span between the oldest and newest pageview in fractional days; spans
/// shorter than a day count as one
pub fn days_observed(pageviews: &[Pageview]) -> f64 {
    let timestamps = pageviews.iter().map(|p| p.timestamp);
    let oldest: Option<DateTime<Utc>> = timestamps.clone().min();
    let newest: Option<DateTime<Utc>> = timestamps.max();
    match (oldest, newest) {
        (Some(oldest), Some(newest)) => ((newest - oldest).num_seconds() as f64 / SECONDS_PER_DAY).max(1.0),
        _ => 1.0,
    }
}

/// Annual projection from the trailing window's pageviews.
///
/// Every pageview is costed with its visitor's country on the device side,
/// the sum is stretched to the reference month and multiplied by twelve.
/// No pageviews means exactly zero.
pub fn estimate_yearly(
    resources: &[ResourceTrace],
    intensities: &IntensityTable,
    pageviews: &[Pageview],
    reference: YearMonth,
) -> EmissionEstimate {
    let (domains, green_domains) = domain_counts(resources);
    let zero = EmissionEstimate {
        domains,
        green_domains,
        emission: 0.0,
    };

    let Some(first_visit) = VisitAggregate::from_pageviews(pageviews).first_visit_percentage() else {
        return zero;
    };

    // Visits only differ by visitor country, so cost each country once.
    // Ordered so the float sum is the same on every call.
    let mut per_country: BTreeMap<Option<&str>, u64> = BTreeMap::new();
    for pageview in pageviews {
        *per_country.entry(pageview.country_code.as_deref()).or_default() += 1;
    }
    let observed: f64 = per_country
        .into_iter()
        .map(|(country, visits)| visits as f64 * visit_emission(resources, intensities, country, first_visit))
        .sum();

    let factor = reference.days_in_month() as f64 / days_observed(pageviews);
    EmissionEstimate {
        emission: observed * factor * 12.0,
        ..zero
    }
}

/// Result of costing an arbitrary URL without storing anything
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PageCalculation {
    #[serde(rename = "co2perPageview")]
    pub co2_per_pageview: f64,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "carbonIntensity")]
    pub carbon_intensity: Option<f64>,
}

pub fn calculate_page(resources: &[ResourceTrace], intensities: &IntensityTable) -> PageCalculation {
    let estimate = estimate_pageview(resources, intensities);
    PageCalculation {
        co2_per_pageview: estimate.emission,
        total_size: resources.iter().map(|r| r.transfer_size).sum(),
        carbon_intensity: resources
            .first()
            .and_then(|r| intensities.known(r.country_code.as_deref())),
    }
}
