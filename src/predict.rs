//! Grid intensity prediction
//!
//! Each country's annual series is extrapolated with a least-squares trend
//! that is pinned through the most recent measurement: the slope comes from
//! the older points (as offsets from the latest one) and the line is forced
//! through the latest point. Series that cannot produce a finite value are
//! left out of the result rather than reported as zero.

use std::collections::BTreeMap;

use crate::model::{GridIntensitySeries, IntensityPoint, PredictedIntensity, YearMonth};

/// Offset in years between two months, at month resolution
fn years_between(from: &YearMonth, to: &YearMonth) -> f64 {
    from.months_until(to) as f64 / 12.0
}

/// Extrapolate a latest-first series to `target`.
///
/// Returns `NaN` when the trend is undefined: fewer than two points, or a
/// zero OLS denominator (a single historical point, or all historical
/// points on the same date).
pub fn pinned_trend(points: &[IntensityPoint], target: YearMonth) -> f64 {
    let Some((latest, history)) = points.split_first() else {
        return f64::NAN;
    };
    if history.is_empty() {
        return f64::NAN;
    }

    let n = history.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for point in history {
        let dx = years_between(&latest.at, &point.at);
        let dy = point.value - latest.value;
        sum_x += dx;
        sum_y += dy;
        sum_xy += dx * dy;
        sum_xx += dx * dx;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return f64::NAN;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;

    let value = latest.value + slope * years_between(&latest.at, &target);
    // A falling trend may cross zero; intensity can't
    value.max(0.0)
}

/// Predict each country's intensity at `target`. Countries without a usable
/// trend are absent from the map. The fit excludes the pinned latest point,
/// so a series needs at least three points to be predicted.
pub fn predict_intensities(
    series: &[GridIntensitySeries],
    target: YearMonth,
) -> BTreeMap<String, PredictedIntensity> {
    series
        .iter()
        .filter(|s| s.points.len() >= 2)
        .filter_map(|s| {
            let value = pinned_trend(&s.points, target);
            if !value.is_finite() {
                tracing::debug!(country = %s.country_code, "no usable intensity trend");
                return None;
            }
            Some((
                s.country_code.clone(),
                PredictedIntensity {
                    country_code: s.country_code.clone(),
                    value,
                    target,
                    latest_year: s.latest_year,
                    deadlines: s.deadlines.clone(),
                },
            ))
        })
        .collect()
}

/// Mean of every country's latest measured value. Coarser than a prediction,
/// used when no specific country applies.
pub fn global_average(series: &[GridIntensitySeries]) -> Option<f64> {
    let latest: Vec<f64> = series
        .iter()
        .filter_map(|s| s.latest())
        .map(|p| p.value)
        .filter(|v| v.is_finite())
        .collect();
    if latest.is_empty() {
        return None;
    }
    Some(latest.iter().sum::<f64>() / latest.len() as f64)
}
