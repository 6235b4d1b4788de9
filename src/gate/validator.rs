// ABOUTME: Phase gate validator deciding PASS, REWORK or FAIL for a phase
// ABOUTME: Combines ratcheted thresholds, contract status, member outcomes and hooks

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::criteria::{CoverageAdvisory, GateCriterion, Severity, SeverityPolicy, ValidatorHook};
use super::{score, CriterionResult, GateIssue, GateKind, GateResult, Verdict};
use crate::contract::SharedRegistry;
use crate::engine::{ArtifactRef, NodeStatus, WorkflowRunState};
use crate::graph::{Phase, WorkflowGraph};
use crate::quality::{round6, Metric, ProgressiveQualityManager, QualityMetrics};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Everything the exit gate needs to know about one phase of a graph
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseScope {
    pub phase: Phase,
    pub boundary: String,
    pub members: Vec<String>,
    /// Contract names locked by the phase's nodes
    pub produces: Vec<String>,
    /// Contract names consumed by the phase's nodes
    pub consumes: Vec<String>,
    pub artifacts: Vec<ArtifactRef>,
}

impl PhaseScope {
    pub fn from_graph(graph: &WorkflowGraph, phase: Phase, state: &WorkflowRunState) -> Option<Self> {
        let boundary = graph.boundary_for(phase)?.to_string();
        let members = graph.members_of(phase);

        let artifacts = members
            .iter()
            .chain(std::iter::once(&boundary))
            .filter_map(|id| state.node(id))
            .flat_map(|node| node.artifacts.iter().cloned())
            .collect();

        Some(Self {
            phase,
            boundary,
            members,
            produces: graph.contracts_locked_by_phase(phase),
            consumes: graph.contracts_consumed_by_phase(phase),
            artifacts,
        })
    }
}

struct RegisteredHook {
    criterion: GateCriterion,
    hook: Arc<dyn ValidatorHook>,
}

pub struct PhaseGateValidator {
    quality: ProgressiveQualityManager,
    contracts: SharedRegistry,
    policy: Arc<dyn SeverityPolicy>,
    hooks: Vec<RegisteredHook>,
    max_iterations: u32,
}

impl PhaseGateValidator {
    pub fn new(quality: ProgressiveQualityManager, contracts: SharedRegistry) -> Self {
        Self {
            quality,
            contracts,
            policy: Arc::new(CoverageAdvisory),
            hooks: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SeverityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hook(mut self, criterion: GateCriterion, hook: Arc<dyn ValidatorHook>) -> Self {
        self.hooks.push(RegisteredHook { criterion, hook });
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn quality(&self) -> &ProgressiveQualityManager {
        &self.quality
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Every earlier phase declared in the run must have a latest outcome of
    /// PASS. No partial credit: any gap fails the entry gate.
    pub fn validate_entry(&self, phase: Phase, state: &WorkflowRunState) -> GateResult {
        let mut criteria = Vec::new();
        let mut blocking = Vec::new();

        for prerequisite in state.phases.iter().copied().filter(|p| *p < phase) {
            let id = format!("entry:{}", prerequisite);
            let latest = state.latest_outcome(prerequisite).map(|o| o.verdict);
            let met = latest == Some(Verdict::Pass);

            let detail = match latest {
                Some(verdict) => format!("latest {} outcome is {}", prerequisite, verdict),
                None => format!("{} has not been evaluated", prerequisite),
            };

            if !met {
                blocking.push(GateIssue {
                    criterion: id.clone(),
                    message: format!("prerequisite phase {} not passed: {}", prerequisite, detail),
                    remediable: false,
                    implicated: Vec::new(),
                });
            }
            criteria.push(CriterionResult {
                id,
                met,
                blocking: true,
                detail,
            });
        }

        let verdict = if blocking.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        debug!("Entry gate for {}: {}", phase, verdict);

        GateResult {
            kind: GateKind::Entry,
            phase,
            iteration: state.iteration(phase),
            verdict,
            score: score(&criteria),
            criteria,
            blocking_issues: blocking,
            warnings: Vec::new(),
            metrics: None,
            thresholds: None,
            locked_contracts: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    pub async fn validate_exit(
        &self,
        scope: &PhaseScope,
        metrics: &QualityMetrics,
        state: &WorkflowRunState,
    ) -> GateResult {
        let phase = scope.phase;
        let iteration = state.iteration(phase);
        let thresholds = self.quality.thresholds_for(phase, iteration);

        let mut criteria = Vec::new();
        let mut blocking = Vec::new();
        let mut warnings = Vec::new();

        let rework_targets: Vec<String> = scope
            .members
            .iter()
            .filter(|id| state.node_status(id) == Some(NodeStatus::Succeeded))
            .cloned()
            .collect();

        for metric in Metric::ALL {
            let actual = round6(metrics.get(metric));
            let required = thresholds.get(metric);
            let met = actual >= required;
            let severity = match metric {
                Metric::Completeness | Metric::Quality => Severity::Blocking,
                Metric::TestCoverage => self.policy.severity(metric, phase),
            };
            let detail = format!("{:.2} against threshold {:.2}", actual, required);

            if !met {
                let message = format!("{} {}", metric, detail);
                match severity {
                    Severity::Blocking => blocking.push(GateIssue {
                        criterion: metric.to_string(),
                        message,
                        remediable: true,
                        implicated: rework_targets.clone(),
                    }),
                    Severity::Advisory => warnings.push(message),
                }
            }
            criteria.push(CriterionResult {
                id: metric.to_string(),
                met,
                blocking: severity == Severity::Blocking,
                detail,
            });
        }

        self.check_members(scope, state, &mut criteria, &mut blocking);
        self.check_consumed_contracts(scope, &mut criteria, &mut blocking)
            .await;
        self.run_hooks(scope, &rework_targets, &mut criteria, &mut blocking, &mut warnings)
            .await;

        if let Some(previous) = state.latest_outcome(phase).and_then(|o| o.metrics) {
            let report = self.quality.regression(metrics, &previous);
            for regression in &report.regressions {
                warnings.push(format!(
                    "{} regressed by {:.2} ({:.2} -> {:.2})",
                    regression.metric,
                    -regression.delta,
                    regression.previous,
                    regression.current
                ));
            }
        }

        let verdict = Verdict::decide(&blocking, iteration, self.max_iterations);

        let mut locked_contracts = Vec::new();
        if verdict == Verdict::Pass {
            self.lock_produced_contracts(scope, state, &mut locked_contracts, &mut warnings)
                .await;
        }

        info!(
            "Exit gate for {} iteration {}: {} ({} blocking, {} warnings)",
            phase,
            iteration,
            verdict,
            blocking.len(),
            warnings.len()
        );

        GateResult {
            kind: GateKind::Exit,
            phase,
            iteration,
            verdict,
            score: score(&criteria),
            criteria,
            blocking_issues: blocking,
            warnings,
            metrics: Some(*metrics),
            thresholds: Some(thresholds),
            locked_contracts,
            evaluated_at: Utc::now(),
        }
    }

    /// Outcome for a phase whose boundary never ran because part of the
    /// phase failed terminally. Always FAIL.
    pub fn fail_phase(&self, scope: &PhaseScope, state: &WorkflowRunState) -> GateResult {
        let phase = scope.phase;
        let mut criteria = Vec::new();
        let mut blocking = Vec::new();

        self.check_members(scope, state, &mut criteria, &mut blocking);

        let boundary_status = state.node_status(&scope.boundary);
        if boundary_status == Some(NodeStatus::Failed) {
            blocking.push(GateIssue {
                criterion: format!("node:{}", scope.boundary),
                message: format!("boundary node {} failed", scope.boundary),
                remediable: false,
                implicated: Vec::new(),
            });
            criteria.push(CriterionResult {
                id: format!("node:{}", scope.boundary),
                met: false,
                blocking: true,
                detail: "FAILED".to_string(),
            });
        }

        warn!("Phase {} failed without exit evaluation", phase);

        GateResult {
            kind: GateKind::Exit,
            phase,
            iteration: state.iteration(phase),
            verdict: Verdict::Fail,
            score: score(&criteria),
            criteria,
            blocking_issues: blocking,
            warnings: Vec::new(),
            metrics: None,
            thresholds: None,
            locked_contracts: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    fn check_members(
        &self,
        scope: &PhaseScope,
        state: &WorkflowRunState,
        criteria: &mut Vec<CriterionResult>,
        blocking: &mut Vec<GateIssue>,
    ) {
        for member in &scope.members {
            let status = state.node_status(member);
            let met = !matches!(status, Some(NodeStatus::Failed) | Some(NodeStatus::Skipped));
            let id = format!("node:{}", member);

            if !met {
                blocking.push(GateIssue {
                    criterion: id.clone(),
                    message: format!("phase member {} did not succeed", member),
                    remediable: false,
                    implicated: Vec::new(),
                });
            }
            criteria.push(CriterionResult {
                id,
                met,
                blocking: true,
                detail: status.map(|s| s.to_string()).unwrap_or_default(),
            });
        }
    }

    async fn check_consumed_contracts(
        &self,
        scope: &PhaseScope,
        criteria: &mut Vec<CriterionResult>,
        blocking: &mut Vec<GateIssue>,
    ) {
        if scope.consumes.is_empty() {
            return;
        }

        let registry = self.contracts.read().await;
        for name in &scope.consumes {
            let id = format!("contract:{}", name);

            if let Some(active) = registry.active_version(name) {
                criteria.push(CriterionResult {
                    id,
                    met: true,
                    blocking: true,
                    detail: format!("{} is ACTIVE", active.id),
                });
                continue;
            }

            let issue = match registry.draft_version(name) {
                Some(draft) => GateIssue {
                    criterion: id.clone(),
                    message: format!("consumed contract {} is still DRAFT", draft.id),
                    remediable: true,
                    implicated: vec![draft.producer.clone()],
                },
                None => GateIssue {
                    criterion: id.clone(),
                    message: format!("consumed contract {} has no usable version", name),
                    remediable: false,
                    implicated: Vec::new(),
                },
            };
            criteria.push(CriterionResult {
                id,
                met: false,
                blocking: true,
                detail: issue.message.clone(),
            });
            blocking.push(issue);
        }
    }

    async fn run_hooks(
        &self,
        scope: &PhaseScope,
        rework_targets: &[String],
        criteria: &mut Vec<CriterionResult>,
        blocking: &mut Vec<GateIssue>,
        warnings: &mut Vec<String>,
    ) {
        for registered in self
            .hooks
            .iter()
            .filter(|h| h.criterion.applies_to(scope.phase))
        {
            let criterion = &registered.criterion;
            let result = registered
                .hook
                .evaluate(&criterion.id, scope.phase, &scope.artifacts)
                .await;

            if !result.met {
                if criterion.blocking {
                    blocking.push(GateIssue {
                        criterion: criterion.id.clone(),
                        message: result.detail.clone(),
                        remediable: true,
                        implicated: rework_targets.to_vec(),
                    });
                } else {
                    warnings.push(format!("{}: {}", criterion.id, result.detail));
                }
            }
            criteria.push(CriterionResult {
                id: criterion.id.clone(),
                met: result.met,
                blocking: criterion.blocking,
                detail: result.detail,
            });
        }
    }

    /// The boundary is still RUNNING while its gate is evaluated, so a
    /// passing verdict counts it as a succeeded producer.
    async fn lock_produced_contracts(
        &self,
        scope: &PhaseScope,
        state: &WorkflowRunState,
        locked: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        if scope.produces.is_empty() {
            return;
        }

        let ledger = |node_id: &str| {
            node_id == scope.boundary || state.node_status(node_id) == Some(NodeStatus::Succeeded)
        };
        let mut registry = self.contracts.write().await;
        for name in &scope.produces {
            let Some(draft_id) = registry.draft_version(name).map(|c| c.id.clone()) else {
                if registry.active_version(name).is_none() {
                    warnings.push(format!("produced contract {} has no DRAFT to lock", name));
                }
                continue;
            };

            match registry.activate(&draft_id, &ledger) {
                Ok(contract) => locked.push(contract.id),
                Err(e) => warnings.push(format!("lockdown of {} failed: {}", draft_id, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractRegistry, ContractSpec};
    use crate::engine::NodeEvent;
    use crate::graph::Node;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::RwLock;

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new("gate-test")
            .with_node("spec", Node::interface().locks("users-api"))
            .with_node(
                "build",
                Node::action()
                    .in_phase(Phase::Implementation)
                    .depends_on(["spec"])
                    .consumes("users-api"),
            )
            .with_node(
                "impl_gate",
                Node::checkpoint()
                    .in_phase(Phase::Implementation)
                    .depends_on(["build"]),
            )
    }

    fn succeed(state: &mut WorkflowRunState, node_id: &str) {
        let node = state.nodes.get_mut(node_id).unwrap();
        node.apply(NodeEvent::MarkReady).unwrap();
        node.apply(NodeEvent::Start).unwrap();
        node.apply(NodeEvent::Succeed).unwrap();
    }

    async fn registry_with_active_contract() -> SharedRegistry {
        let mut registry = ContractRegistry::new();
        let draft = registry
            .create(ContractSpec::new("users-api", "json-schema", "spec", json!({})))
            .unwrap();
        registry.activate(&draft.id, &|_: &str| true).unwrap();
        Arc::new(RwLock::new(registry))
    }

    fn validator(registry: SharedRegistry) -> PhaseGateValidator {
        PhaseGateValidator::new(ProgressiveQualityManager::default(), registry)
    }

    fn ready_state(graph: &WorkflowGraph) -> WorkflowRunState {
        let mut state = WorkflowRunState::new("run-1", graph);
        succeed(&mut state, "spec");
        succeed(&mut state, "build");
        state
    }

    #[tokio::test]
    async fn test_exit_gate_rework_names_completeness() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await);

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.55, 0.55, 0.9), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Rework);
        assert_eq!(result.blocking_issues.len(), 1);
        assert_eq!(result.blocking_issues[0].criterion, "completeness");
        assert_eq!(result.implicated_nodes().into_iter().collect::<Vec<_>>(), vec!["build"]);
        assert!(result.met_criteria().contains(&"quality"));
        assert_eq!(result.thresholds.unwrap().completeness, 0.60);
    }

    #[tokio::test]
    async fn test_exit_gate_passes_and_tracks_score() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await);

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.9, 0.9, 0.1), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.blocking_issues.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("test_coverage"));
        // completeness, quality, node:build, contract:users-api met; coverage not
        assert_eq!(result.score, 0.8);
    }

    #[tokio::test]
    async fn test_strict_coverage_blocks() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await)
            .with_policy(Arc::new(crate::gate::StrictCoverage));

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.9, 0.9, 0.1), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Rework);
        assert_eq!(result.blocking_issues[0].criterion, "test_coverage");
    }

    #[tokio::test]
    async fn test_rework_budget_exhausted_fails() {
        let graph = graph();
        let mut state = ready_state(&graph);
        state.iterations.insert(Phase::Implementation, 3);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await);

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.1, 0.9, 0.9), &state)
            .await;

        assert_eq!(result.iteration, 3);
        assert_eq!(result.verdict, Verdict::Fail);
    }

    #[tokio::test]
    async fn test_draft_contract_is_remediable() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();

        let mut registry = ContractRegistry::new();
        registry
            .create(ContractSpec::new("users-api", "json-schema", "spec", json!({})))
            .unwrap();
        let gate = validator(Arc::new(RwLock::new(registry)));

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.9, 0.9, 0.9), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Rework);
        assert_eq!(result.blocking_issues[0].implicated, vec!["spec"]);
    }

    #[tokio::test]
    async fn test_missing_contract_fails() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(Arc::new(RwLock::new(ContractRegistry::new())));

        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.9, 0.9, 0.9), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Fail);
        assert!(!result.blocking_issues[0].remediable);
    }

    #[tokio::test]
    async fn test_metrics_compared_at_threshold_precision() {
        let graph = graph();
        let mut state = ready_state(&graph);
        state.iterations.insert(Phase::Implementation, 2);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await);

        // completeness threshold at iteration 2 is 0.70
        let result = gate
            .validate_exit(&scope, &QualityMetrics::new(0.6999999999, 0.9, 0.9), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.met_criteria().contains(&"completeness"));
    }

    #[tokio::test]
    async fn test_boundary_locks_its_own_contract_on_pass() {
        let graph = WorkflowGraph::new("design")
            .with_node("draft_doc", Node::action().in_phase(Phase::Design))
            .with_node(
                "design_gate",
                Node::checkpoint()
                    .in_phase(Phase::Design)
                    .locks("design-doc")
                    .depends_on(["draft_doc"]),
            );
        let mut state = WorkflowRunState::new("run-1", &graph);
        succeed(&mut state, "draft_doc");
        let boundary = state.nodes.get_mut("design_gate").unwrap();
        boundary.apply(NodeEvent::MarkReady).unwrap();
        boundary.apply(NodeEvent::Start).unwrap();

        let mut registry = ContractRegistry::new();
        registry
            .create(ContractSpec::new("design-doc", "markdown", "design_gate", json!({})))
            .unwrap();
        let registry = Arc::new(RwLock::new(registry));

        let scope = PhaseScope::from_graph(&graph, Phase::Design, &state).unwrap();
        let result = validator(registry.clone())
            .validate_exit(&scope, &QualityMetrics::new(1.0, 1.0, 1.0), &state)
            .await;

        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.locked_contracts, vec!["design-doc@1.0"]);
        assert!(result.warnings.is_empty());
        assert!(registry.read().await.is_active("design-doc@1.0"));
    }

    #[tokio::test]
    async fn test_failed_member_fails_phase() {
        let graph = graph();
        let mut state = WorkflowRunState::new("run-1", &graph);
        succeed(&mut state, "spec");
        let build = state.nodes.get_mut("build").unwrap();
        build.apply(NodeEvent::MarkReady).unwrap();
        build.apply(NodeEvent::Start).unwrap();
        build.apply(NodeEvent::Fail { retry: false }).unwrap();

        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let gate = validator(registry_with_active_contract().await);
        let result = gate.fail_phase(&scope, &state);

        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.failed_criteria(), vec!["node:build"]);
    }

    #[test]
    fn test_entry_gate_requires_prior_pass() {
        let graph = WorkflowGraph::new("phases")
            .with_node("design_gate", Node::checkpoint().in_phase(Phase::Design))
            .with_node(
                "impl_gate",
                Node::checkpoint()
                    .in_phase(Phase::Implementation)
                    .depends_on(["design_gate"]),
            );
        let state = WorkflowRunState::new("run-1", &graph);
        let gate = validator(Arc::new(RwLock::new(ContractRegistry::new())));

        let entry = gate.validate_entry(Phase::Implementation, &state);
        assert_eq!(entry.verdict, Verdict::Fail);
        assert_eq!(entry.blocking_issues[0].criterion, "entry:design");
        assert_eq!(entry.score, 0.0);

        // requirements is not declared by this graph, so design has no prerequisites
        assert!(gate.validate_entry(Phase::Design, &state).passed());
    }

    struct ArchitectureHook;

    #[async_trait]
    impl ValidatorHook for ArchitectureHook {
        async fn evaluate(&self, _id: &str, _phase: Phase, _artifacts: &[ArtifactRef]) -> crate::gate::HookVerdict {
            crate::gate::HookVerdict::unmet("layering violation")
        }
    }

    #[tokio::test]
    async fn test_hooks_respect_blocking_flag() {
        let graph = graph();
        let state = ready_state(&graph);
        let scope = PhaseScope::from_graph(&graph, Phase::Implementation, &state).unwrap();
        let metrics = QualityMetrics::new(0.9, 0.9, 0.9);

        let advisory = validator(registry_with_active_contract().await)
            .with_hook(GateCriterion::advisory("architecture"), Arc::new(ArchitectureHook));
        let result = advisory.validate_exit(&scope, &metrics, &state).await;
        assert_eq!(result.verdict, Verdict::Pass);
        assert_eq!(result.warnings, vec!["architecture: layering violation"]);

        let blocking = validator(registry_with_active_contract().await)
            .with_hook(GateCriterion::blocking("architecture"), Arc::new(ArchitectureHook));
        let result = blocking.validate_exit(&scope, &metrics, &state).await;
        assert_eq!(result.verdict, Verdict::Rework);
    }
}
