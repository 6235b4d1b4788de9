// ABOUTME: Phase gate validation at phase entry and exit
// ABOUTME: Gate results, verdicts and the blocking-issue model used for rework

pub mod criteria;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::graph::Phase;
use crate::quality::{QualityMetrics, QualityThresholdBundle};

pub use criteria::{
    CoverageAdvisory, GateCriterion, HookVerdict, Severity, SeverityPolicy, StrictCoverage,
    ValidatorHook,
};
pub use validator::{PhaseGateValidator, PhaseScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Rework,
    Fail,
}

impl Verdict {
    /// PASS with no blocking issues. REWORK only while every blocking issue
    /// can be remediated and the rework budget is not spent.
    pub fn decide(blocking: &[GateIssue], iteration: u32, max_iterations: u32) -> Verdict {
        if blocking.is_empty() {
            Verdict::Pass
        } else if blocking.iter().all(|issue| issue.remediable) && iteration < max_iterations {
            Verdict::Rework
        } else {
            Verdict::Fail
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Rework => write!(f, "REWORK"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: String,
    pub met: bool,
    pub blocking: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateIssue {
    pub criterion: String,
    pub message: String,
    pub remediable: bool,
    /// Nodes to reset to PENDING if the phase goes to rework
    #[serde(default)]
    pub implicated: Vec<String>,
}

/// Result of one gate evaluation. Exit results are appended to the run's
/// history as [`PhaseOutcome`]s and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub kind: GateKind,
    pub phase: Phase,
    pub iteration: u32,
    pub verdict: Verdict,
    pub criteria: Vec<CriterionResult>,
    pub blocking_issues: Vec<GateIssue>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// met / (met + failed) over all criteria
    pub score: f64,
    pub metrics: Option<QualityMetrics>,
    pub thresholds: Option<QualityThresholdBundle>,
    #[serde(default)]
    pub locked_contracts: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

pub type PhaseOutcome = GateResult;

impl GateResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn met_criteria(&self) -> Vec<&str> {
        self.criteria
            .iter()
            .filter(|c| c.met)
            .map(|c| c.id.as_str())
            .collect()
    }

    pub fn failed_criteria(&self) -> Vec<&str> {
        self.criteria
            .iter()
            .filter(|c| !c.met)
            .map(|c| c.id.as_str())
            .collect()
    }

    pub fn implicated_nodes(&self) -> BTreeSet<String> {
        self.blocking_issues
            .iter()
            .flat_map(|issue| issue.implicated.iter().cloned())
            .collect()
    }
}

pub(crate) fn score(criteria: &[CriterionResult]) -> f64 {
    if criteria.is_empty() {
        return 1.0;
    }
    let met = criteria.iter().filter(|c| c.met).count();
    met as f64 / criteria.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(remediable: bool) -> GateIssue {
        GateIssue {
            criterion: "completeness".to_string(),
            message: "below threshold".to_string(),
            remediable,
            implicated: vec!["build".to_string()],
        }
    }

    #[test]
    fn test_verdict_decision() {
        assert_eq!(Verdict::decide(&[], 1, 3), Verdict::Pass);
        assert_eq!(Verdict::decide(&[], 9, 3), Verdict::Pass);
        assert_eq!(Verdict::decide(&[issue(true)], 1, 3), Verdict::Rework);
        assert_eq!(Verdict::decide(&[issue(true)], 3, 3), Verdict::Fail);
        assert_eq!(
            Verdict::decide(&[issue(true), issue(false)], 1, 3),
            Verdict::Fail
        );
    }

    #[test]
    fn test_score() {
        let criteria = vec![
            CriterionResult {
                id: "completeness".to_string(),
                met: false,
                blocking: true,
                detail: String::new(),
            },
            CriterionResult {
                id: "quality".to_string(),
                met: true,
                blocking: true,
                detail: String::new(),
            },
        ];
        assert_eq!(score(&criteria), 0.5);
        assert_eq!(score(&[]), 1.0);
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_string(&Verdict::Rework).unwrap();
        assert_eq!(json, "\"REWORK\"");
        assert_eq!(Verdict::Fail.to_string(), "FAIL");
    }
}
