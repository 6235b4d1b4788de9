// ABOUTME: Pluggable gate criteria: metric severity policies and validator hooks
// ABOUTME: Completeness and quality shortfalls always block; the rest is policy

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::ArtifactRef;
use crate::graph::Phase;
use crate::quality::Metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

/// Decides how a metric shortfall counts at an exit gate. Completeness and
/// quality are blocking regardless of what a policy answers.
pub trait SeverityPolicy: Send + Sync {
    fn severity(&self, metric: Metric, phase: Phase) -> Severity;
}

/// test_coverage shortfalls are recorded as warnings
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageAdvisory;

impl SeverityPolicy for CoverageAdvisory {
    fn severity(&self, metric: Metric, _phase: Phase) -> Severity {
        match metric {
            Metric::Completeness | Metric::Quality => Severity::Blocking,
            Metric::TestCoverage => Severity::Advisory,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StrictCoverage;

impl SeverityPolicy for StrictCoverage {
    fn severity(&self, _metric: Metric, _phase: Phase) -> Severity {
        Severity::Blocking
    }
}

/// An externally evaluated exit criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCriterion {
    pub id: String,
    /// Phases the criterion applies to; empty means every phase
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub blocking: bool,
}

impl GateCriterion {
    pub fn blocking(id: &str) -> Self {
        Self {
            id: id.to_string(),
            phases: Vec::new(),
            blocking: true,
        }
    }

    pub fn advisory(id: &str) -> Self {
        Self {
            id: id.to_string(),
            phases: Vec::new(),
            blocking: false,
        }
    }

    pub fn for_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn applies_to(&self, phase: Phase) -> bool {
        self.phases.is_empty() || self.phases.contains(&phase)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookVerdict {
    pub met: bool,
    pub detail: String,
}

impl HookVerdict {
    pub fn met(detail: &str) -> Self {
        Self {
            met: true,
            detail: detail.to_string(),
        }
    }

    pub fn unmet(detail: &str) -> Self {
        Self {
            met: false,
            detail: detail.to_string(),
        }
    }
}

/// Content-level checks (architecture conformance, behaviour specs, ...)
/// live behind this hook; the gate only sees met / not met.
#[async_trait]
pub trait ValidatorHook: Send + Sync {
    async fn evaluate(
        &self,
        criterion_id: &str,
        phase: Phase,
        artifacts: &[ArtifactRef],
    ) -> HookVerdict;
}
