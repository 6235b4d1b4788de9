// ABOUTME: Regression and trend analysis over per-iteration quality metrics
// ABOUTME: Regressions are advisory; trends use an ordinary-least-squares slope

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{round6, Metric, QualityMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: Metric,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub regressions: Vec<MetricDelta>,
    pub improvements: Vec<MetricDelta>,
}

impl RegressionReport {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Declining,
    InsufficientData,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Improving => write!(f, "improving"),
            TrendDirection::Stable => write!(f, "stable"),
            TrendDirection::Declining => write!(f, "declining"),
            TrendDirection::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub direction: TrendDirection,
    pub points: usize,
    pub completeness_slope: Option<f64>,
    pub quality_slope: Option<f64>,
    /// Informational only; never drives the direction
    pub test_coverage_slope: Option<f64>,
}

pub fn detect_regression(
    current: &QualityMetrics,
    previous: &QualityMetrics,
    tolerance: f64,
) -> RegressionReport {
    let mut report = RegressionReport::default();

    for metric in Metric::ALL {
        let delta = round6(current.get(metric) - previous.get(metric));
        let entry = MetricDelta {
            metric,
            previous: previous.get(metric),
            current: current.get(metric),
            delta,
        };

        if delta < -tolerance {
            report.regressions.push(entry);
        } else if delta > tolerance {
            report.improvements.push(entry);
        }
    }

    report
}

pub fn analyze_trend(history: &[QualityMetrics], tolerance: f64) -> TrendReport {
    let series = |metric: Metric| -> Vec<f64> { history.iter().map(|m| m.get(metric)).collect() };

    let completeness_slope = ols_slope(&series(Metric::Completeness));
    let quality_slope = ols_slope(&series(Metric::Quality));
    let test_coverage_slope = ols_slope(&series(Metric::TestCoverage));

    let direction = match (completeness_slope, quality_slope) {
        (Some(c), Some(q)) if c < -tolerance || q < -tolerance => TrendDirection::Declining,
        (Some(c), Some(q)) if c > tolerance && q > tolerance => TrendDirection::Improving,
        (Some(_), Some(_)) => TrendDirection::Stable,
        _ => TrendDirection::InsufficientData,
    };

    TrendReport {
        direction,
        points: history.len(),
        completeness_slope,
        quality_slope,
        test_coverage_slope,
    }
}

/// Slope of the least-squares line through `(i, values[i])`
pub fn ols_slope(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }

    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let (numerator, denominator) =
        values
            .iter()
            .enumerate()
            .fold((0.0, 0.0), |(num, den), (i, y)| {
                let dx = i as f64 - mean_x;
                (num + dx * (y - mean_y), den + dx * dx)
            });

    Some(round6(numerator / denominator))
}
