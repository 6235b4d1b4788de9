// ABOUTME: Iteration-aware quality thresholds that only ever tighten
// ABOUTME: threshold(m, n) = min(baseline + (n - 1) * increment, cap) with phase boosts

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::analysis::{analyze_trend, detect_regression, RegressionReport, TrendReport};
use super::{round6, Metric, QualityMetrics};
use crate::graph::Phase;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QualityConfigError {
    #[error("{metric} increment must not be negative (got {value})")]
    NegativeIncrement { metric: Metric, value: f64 },

    #[error("{metric} baseline {baseline} exceeds its cap {cap}")]
    BaselineAboveCap {
        metric: Metric,
        baseline: f64,
        cap: f64,
    },

    #[error("{field} must be within 0.0..=1.0 (got {value})")]
    OutOfRange { field: String, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_baseline")]
    pub baseline: QualityMetrics,
    #[serde(default = "default_increment")]
    pub increment: QualityMetrics,
    #[serde(default = "default_cap")]
    pub cap: QualityMetrics,
    /// Phases whose completeness bar starts higher
    #[serde(default = "default_boosted_phases")]
    pub boosted_phases: Vec<Phase>,
    #[serde(default = "default_completeness_boost")]
    pub completeness_boost: f64,
    #[serde(default = "default_tolerance")]
    pub regression_tolerance: f64,
    #[serde(default = "default_tolerance")]
    pub trend_tolerance: f64,
}

fn default_baseline() -> QualityMetrics {
    QualityMetrics::new(0.60, 0.50, 0.60)
}

fn default_increment() -> QualityMetrics {
    QualityMetrics::new(0.10, 0.10, 0.10)
}

fn default_cap() -> QualityMetrics {
    QualityMetrics::new(0.95, 0.90, 0.90)
}

fn default_boosted_phases() -> Vec<Phase> {
    vec![Phase::Requirements, Phase::Deployment]
}

fn default_completeness_boost() -> f64 {
    0.10
}

fn default_tolerance() -> f64 {
    0.05
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            increment: default_increment(),
            cap: default_cap(),
            boosted_phases: default_boosted_phases(),
            completeness_boost: default_completeness_boost(),
            regression_tolerance: default_tolerance(),
            trend_tolerance: default_tolerance(),
        }
    }
}

impl QualityConfig {
    /// Reject settings that would let a threshold decrease across iterations
    pub fn validate(&self) -> Result<(), QualityConfigError> {
        for metric in Metric::ALL {
            let baseline = self.baseline.get(metric);
            let increment = self.increment.get(metric);
            let cap = self.cap.get(metric);

            if increment < 0.0 {
                return Err(QualityConfigError::NegativeIncrement {
                    metric,
                    value: increment,
                });
            }
            if baseline > cap {
                return Err(QualityConfigError::BaselineAboveCap {
                    metric,
                    baseline,
                    cap,
                });
            }
            for (field, value) in [("baseline", baseline), ("cap", cap)] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(QualityConfigError::OutOfRange {
                        field: format!("{}.{}", field, metric),
                        value,
                    });
                }
            }
        }

        for (field, value) in [
            ("completeness_boost", self.completeness_boost),
            ("regression_tolerance", self.regression_tolerance),
            ("trend_tolerance", self.trend_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(QualityConfigError::OutOfRange {
                    field: field.to_string(),
                    value,
                });
            }
        }

        Ok(())
    }
}

/// Thresholds in force for one (phase, iteration). Computed on demand; the
/// values a gate used are persisted on its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholdBundle {
    pub phase: Phase,
    pub iteration: u32,
    pub completeness: f64,
    pub quality: f64,
    pub test_coverage: f64,
}

impl QualityThresholdBundle {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Completeness => self.completeness,
            Metric::Quality => self.quality,
            Metric::TestCoverage => self.test_coverage,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressiveQualityManager {
    config: QualityConfig,
}

impl ProgressiveQualityManager {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn thresholds_for(&self, phase: Phase, iteration: u32) -> QualityThresholdBundle {
        let iteration = iteration.max(1);
        let bundle = QualityThresholdBundle {
            phase,
            iteration,
            completeness: self.threshold(Metric::Completeness, phase, iteration),
            quality: self.threshold(Metric::Quality, phase, iteration),
            test_coverage: self.threshold(Metric::TestCoverage, phase, iteration),
        };

        debug!(
            "Thresholds for {} iteration {}: completeness={:.2} quality={:.2} test_coverage={:.2}",
            phase, iteration, bundle.completeness, bundle.quality, bundle.test_coverage
        );
        bundle
    }

    pub fn regression(&self, current: &QualityMetrics, previous: &QualityMetrics) -> RegressionReport {
        detect_regression(current, previous, self.config.regression_tolerance)
    }

    pub fn trend(&self, history: &[QualityMetrics]) -> TrendReport {
        analyze_trend(history, self.config.trend_tolerance)
    }

    fn threshold(&self, metric: Metric, phase: Phase, iteration: u32) -> f64 {
        let mut value = self.config.baseline.get(metric)
            + f64::from(iteration - 1) * self.config.increment.get(metric);

        if metric == Metric::Completeness && self.config.boosted_phases.contains(&phase) {
            value += self.config.completeness_boost;
        }

        round6(value.min(self.config.cap.get(metric)))
    }
}
