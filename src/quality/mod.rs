// ABOUTME: Progressive quality management for iterative phase delivery
// ABOUTME: Ratcheting thresholds per (phase, iteration) plus regression and trend analysis

pub mod analysis;
pub mod thresholds;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use analysis::{MetricDelta, RegressionReport, TrendDirection, TrendReport};
pub use thresholds::{
    ProgressiveQualityManager, QualityConfig, QualityConfigError, QualityThresholdBundle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Completeness,
    Quality,
    TestCoverage,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Completeness, Metric::Quality, Metric::TestCoverage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Completeness => "completeness",
            Metric::Quality => "quality",
            Metric::TestCoverage => "test_coverage",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scores in `0.0..=1.0` reported by node work for a phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(default)]
    pub completeness: f64,
    #[serde(default)]
    pub quality: f64,
    #[serde(default)]
    pub test_coverage: f64,
}

impl QualityMetrics {
    pub fn new(completeness: f64, quality: f64, test_coverage: f64) -> Self {
        Self {
            completeness,
            quality,
            test_coverage,
        }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Completeness => self.completeness,
            Metric::Quality => self.quality,
            Metric::TestCoverage => self.test_coverage,
        }
    }

    /// Per-metric mean, `None` for an empty slice
    pub fn mean(samples: &[QualityMetrics]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let average = |metric: Metric| round6(samples.iter().map(|m| m.get(metric)).sum::<f64>() / n);

        Some(Self {
            completeness: average(Metric::Completeness),
            quality: average(Metric::Quality),
            test_coverage: average(Metric::TestCoverage),
        })
    }
}

/// Six decimal places keeps threshold arithmetic free of float drift
pub(crate) fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
