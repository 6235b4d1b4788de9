// ABOUTME: Command implementations for the phaseflow CLI
// ABOUTME: Handles validate, plan, thresholds and inspect

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::config::Config;
use crate::engine::{DependencyGraph, NodeStatus, WorkflowRunState};
use crate::graph::{GraphParser, GraphValidator, Phase, WorkflowGraph};
use crate::quality::{Metric, ProgressiveQualityManager, RegressionReport, TrendReport};
use crate::store::{JsonFileStore, StateStore};

async fn load_graph(path: &Path) -> Result<WorkflowGraph> {
    GraphParser::new()
        .parse_file(path)
        .await
        .with_context(|| format!("Failed to load graph {}", path.display()))
}

/// Validate a workflow graph file
pub async fn validate_graph(path: PathBuf) -> Result<()> {
    info!("Validating graph: {}", path.display());

    let graph = load_graph(&path).await?;
    let report = GraphValidator::new().validate(&graph);

    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }

    if !report.is_valid {
        for error in &report.errors {
            println!("  error: {}", error);
        }
        return Err(anyhow::anyhow!(
            "Graph '{}' is invalid ({} error(s))",
            graph.id,
            report.errors.len()
        ));
    }

    println!("✓ Graph '{}' is valid", graph.id);
    println!("  Nodes: {}", graph.nodes.len());
    let phases: Vec<&str> = graph.phases().iter().map(Phase::as_str).collect();
    println!("  Gated phases: {}", phases.join(", "));

    Ok(())
}

/// Print the static wave layout of a graph
pub async fn plan_graph(path: PathBuf, json: bool) -> Result<()> {
    let graph = load_graph(&path).await?;
    let warnings = GraphValidator::new()
        .validate(&graph)
        .into_result()
        .context("Graph rejected")?;
    for warning in warnings {
        warn!("{}", warning);
    }

    let plan = DependencyGraph::from_graph(&graph)?.create_execution_plan()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Graph '{}': {} nodes in {} waves (max parallelism {})",
        graph.id,
        plan.total_nodes,
        plan.execution_depth(),
        plan.max_parallelism()
    );
    for (index, wave) in plan.waves.iter().enumerate() {
        println!("  wave {}: {}", index + 1, wave.join(", "));
    }

    Ok(())
}

/// Print the ratcheted thresholds of a phase for the first `iterations`
pub fn show_thresholds(phase: Phase, iterations: u32, config: &Config) -> Result<()> {
    let manager = ProgressiveQualityManager::new(config.quality.clone());

    println!("Thresholds for {}:", phase);
    println!(
        "  {:>9}  {:>12}  {:>8}  {:>13}",
        "iteration",
        Metric::Completeness.as_str(),
        Metric::Quality.as_str(),
        Metric::TestCoverage.as_str()
    );
    for iteration in 1..=iterations.max(1) {
        let bundle = manager.thresholds_for(phase, iteration);
        println!(
            "  {:>9}  {:>12.2}  {:>8.2}  {:>13.2}",
            iteration, bundle.completeness, bundle.quality, bundle.test_coverage
        );
    }

    Ok(())
}

/// Summarize a run persisted under the state directory
pub async fn inspect_run(
    run_id: String,
    state_dir: Option<PathBuf>,
    json: bool,
    config: &Config,
) -> Result<()> {
    let root = state_dir.unwrap_or_else(|| config.state_dir());
    let store = JsonFileStore::new(&root);
    let state = store
        .load_run(&run_id)
        .await
        .with_context(|| format!("No run {} under {}", run_id, root.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    print_summary(&state);
    let manager = ProgressiveQualityManager::new(config.quality.clone());
    for diagnostics in phase_diagnostics(&state, &manager) {
        print_diagnostics(&diagnostics);
    }
    Ok(())
}

/// Quality movement of one phase across its exit evaluations
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseDiagnostics {
    pub phase: Phase,
    pub trend: TrendReport,
    /// Latest evaluation against the one before it
    pub regression: Option<RegressionReport>,
}

pub fn phase_diagnostics(
    state: &WorkflowRunState,
    manager: &ProgressiveQualityManager,
) -> Vec<PhaseDiagnostics> {
    state
        .phases
        .iter()
        .filter_map(|phase| {
            let history = state.metric_history(*phase);
            if history.is_empty() {
                return None;
            }
            let regression = match history.as_slice() {
                [.., previous, current] => Some(manager.regression(current, previous)),
                _ => None,
            };
            Some(PhaseDiagnostics {
                phase: *phase,
                trend: manager.trend(&history),
                regression,
            })
        })
        .collect()
}

fn print_diagnostics(diagnostics: &PhaseDiagnostics) {
    println!(
        "  {} trend: {} over {} evaluation(s)",
        diagnostics.phase, diagnostics.trend.direction, diagnostics.trend.points
    );
    let Some(report) = &diagnostics.regression else {
        return;
    };
    for (label, deltas) in [
        ("regression", &report.regressions),
        ("improvement", &report.improvements),
    ] {
        for delta in deltas {
            println!(
                "      {}: {} {:.2} -> {:.2}",
                label, delta.metric, delta.previous, delta.current
            );
        }
    }
}

fn print_summary(state: &WorkflowRunState) {
    println!(
        "Run {} (graph '{}') is {} after {} wave(s)",
        state.run_id, state.graph_id, state.status, state.wave_count
    );
    if let Some(failure) = &state.failure {
        println!("  failure: {}", failure.message);
    }

    for (node_id, node) in &state.nodes {
        let marker = match node.status {
            NodeStatus::Succeeded => "✓",
            NodeStatus::Failed => "✗",
            NodeStatus::Skipped => "-",
            _ => " ",
        };
        print!("  {} {} [{}]", marker, node_id, node.status);
        if node.attempts > 1 {
            print!(" attempts={}", node.attempts);
        }
        if let Some(error) = &node.error {
            print!(" error: {}", error);
        }
        println!();
    }

    for outcome in &state.outcomes {
        println!(
            "  gate {} #{}: {} (score {:.2})",
            outcome.phase, outcome.iteration, outcome.verdict, outcome.score
        );
        for issue in &outcome.blocking_issues {
            println!("      blocking: {}", issue.message);
        }
    }
}
