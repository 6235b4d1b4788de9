// ABOUTME: Integration tests for the workflow executor
// ABOUTME: Covers rework loops, the interface barrier, resume, pause/cancel and persistence faults

mod common;

use common::*;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;

use phaseflow::cli::Config;
use phaseflow::contract::{ContractPayload, ContractRegistry, ContractStatus, SharedRegistry};
use phaseflow::engine::{
    AttemptOutcome, EngineError, FailureKind, NodeOutput, NodeStatus, RunStatus,
    WorkflowExecutor,
};
use phaseflow::gate::Verdict;
use phaseflow::graph::{Node, Phase, WorkflowGraph};
use phaseflow::quality::QualityMetrics;
use phaseflow::store::{JsonFileStore, MemoryStore, StateStore};

fn registry() -> SharedRegistry {
    Arc::new(RwLock::new(ContractRegistry::new()))
}

async fn registry_with_api() -> SharedRegistry {
    let contracts = registry();
    contracts.write().await.create(api_contract()).unwrap();
    contracts
}

#[tokio::test]
async fn test_rework_then_pass_ratchets_iteration() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .on("review", 1, metrics(0.5, 0.5, 0.5))
            .on("review", 2, metrics(0.95, 0.9, 0.9)),
    );
    let contracts = registry_with_api().await;
    let executor = executor_with_store(
        worker.clone(),
        Arc::new(MemoryStore::new()),
        contracts.clone(),
    );

    let run_id = executor.submit(implementation_graph()).await.unwrap();
    let state = executor.run_to_completion(&run_id, 20).await.unwrap();

    assert_eq!(state.status, RunStatus::Succeeded);

    let verdicts: Vec<Verdict> = state
        .outcomes_for(Phase::Implementation)
        .iter()
        .map(|o| o.verdict)
        .collect();
    assert_eq!(verdicts, vec![Verdict::Rework, Verdict::Pass]);
    assert_eq!(state.iteration(Phase::Implementation), 2);

    // second evaluation ran against strictly tighter thresholds
    let first = state.outcomes[0].thresholds.unwrap();
    let second = state.outcomes[1].thresholds.unwrap();
    assert!(second.completeness > first.completeness);
    assert!(second.quality > first.quality);

    // the builder ran once per iteration and saw the iteration number
    let build_iterations: Vec<u32> = worker
        .calls_for("build")
        .iter()
        .map(|c| c.iteration)
        .collect();
    assert_eq!(build_iterations, vec![1, 2]);

    let registry = contracts.read().await;
    let api = registry.active_version("api").unwrap();
    assert_eq!(api.id, "api@1.0");
    assert!(api.consumers.contains("build"));
}

#[tokio::test]
async fn test_gate_fail_after_rework_budget() {
    let worker = Arc::new(ScriptedWorker::new().always("review", metrics(0.1, 0.1, 0.1)));
    let executor = WorkflowExecutor::builder(worker)
        .with_contracts(registry_with_api().await)
        .with_max_iterations(2)
        .build();

    let run_id = executor.submit(implementation_graph()).await.unwrap();
    let err = executor.run_to_completion(&run_id, 20).await.unwrap_err();

    match err {
        EngineError::GateBlocked { phase, state, .. } => {
            assert_eq!(phase, Phase::Implementation);
            assert_eq!(state.status, RunStatus::Failed);
            assert_eq!(state.failure.as_ref().unwrap().kind, FailureKind::Gate);
            assert_eq!(state.node_status("review"), Some(NodeStatus::Failed));

            let verdicts: Vec<Verdict> = state.outcomes.iter().map(|o| o.verdict).collect();
            assert_eq!(verdicts, vec![Verdict::Rework, Verdict::Fail]);
        }
        other => panic!("expected GateBlocked, got {:?}", other),
    }
}

fn barrier_graph() -> WorkflowGraph {
    WorkflowGraph::new("barrier")
        .with_node("client", Node::action().consumes("api"))
        .with_node("api", Node::interface().locks("api"))
}

#[tokio::test]
async fn test_interface_nodes_finish_before_wave_peers_start() {
    let worker = Arc::new(ScriptedWorker::new().with_delay("api", Duration::from_millis(50)));
    let contracts = registry_with_api().await;
    let executor = executor_with_store(
        worker.clone(),
        Arc::new(MemoryStore::new()),
        contracts.clone(),
    );

    let run_id = executor.submit(barrier_graph()).await.unwrap();
    let wave = executor.step(&run_id).await.unwrap();

    assert_eq!(wave.dispatched, vec!["api", "client"]);
    assert_eq!(wave.interface_nodes, vec!["api"]);
    assert_eq!(wave.status, RunStatus::Succeeded);

    let api = &worker.calls_for("api")[0];
    let client = &worker.calls_for("client")[0];
    assert!(client.started_at >= api.finished_at);

    // locked before the consumer ran, and the consumer bound to it
    let mut registry = contracts.write().await;
    let api = registry.get("api@1.0").unwrap();
    assert_eq!(api.status, ContractStatus::Active);
    assert!(api.consumers.contains("client"));

    registry
        .evolve(
            "api@1.0",
            ContractPayload(serde_json::json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })),
        )
        .unwrap();
    let flagged: Vec<String> = registry
        .pending_revalidation()
        .iter()
        .map(|request| request.consumer.clone())
        .collect();
    assert_eq!(flagged, vec!["client"]);
}

#[tokio::test]
async fn test_failed_interface_skips_consumers_in_wave() {
    let worker = Arc::new(ScriptedWorker::new().always("api", NodeOutput::failure("no spec")));
    let executor = executor_with_store(
        worker.clone(),
        Arc::new(MemoryStore::new()),
        registry_with_api().await,
    );

    let run_id = executor.submit(barrier_graph()).await.unwrap();
    let wave = executor.step(&run_id).await.unwrap();

    assert_eq!(wave.failed, vec!["api"]);
    assert_eq!(wave.skipped, vec!["client"]);
    assert!(worker.calls_for("client").is_empty());

    let err = executor.run_to_completion(&run_id, 5).await.unwrap_err();
    assert!(matches!(err, EngineError::RunFailed { .. }));
}

#[tokio::test]
async fn test_entry_gate_defers_until_prerequisite_passes() {
    let graph = WorkflowGraph::new("phased")
        .with_node(
            "design_review",
            Node::checkpoint().in_phase(Phase::Design),
        )
        .with_node("impl_work", Node::action().in_phase(Phase::Implementation))
        .with_node(
            "impl_review",
            Node::checkpoint()
                .in_phase(Phase::Implementation)
                .depends_on(["impl_work"]),
        );

    let worker = Arc::new(ScriptedWorker::new());
    let executor = executor(worker.clone());
    let run_id = executor.submit(graph).await.unwrap();

    let first = executor.step(&run_id).await.unwrap();
    assert_eq!(first.dispatched, vec!["design_review"]);
    assert_eq!(first.deferred, vec!["impl_work"]);
    assert_eq!(first.gate_outcomes.len(), 1);
    assert_eq!(first.gate_outcomes[0].verdict, Verdict::Pass);

    let second = executor.step(&run_id).await.unwrap();
    assert_eq!(second.dispatched, vec!["impl_work"]);
    assert!(second.deferred.is_empty());

    let state = executor.run_to_completion(&run_id, 10).await.unwrap();
    assert_eq!(state.status, RunStatus::Succeeded);
    assert!(state.entered_phases.contains(&Phase::Implementation));
}

#[tokio::test]
async fn test_restore_in_fresh_executor() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(dir.path()));
    let contracts = registry_with_api().await;

    let first = executor_with_store(
        Arc::new(ScriptedWorker::new()),
        store.clone(),
        contracts.clone(),
    );
    let run_id = first.submit(implementation_graph()).await.unwrap();
    first.step(&run_id).await.unwrap();
    first.step(&run_id).await.unwrap();
    let before = first.state(&run_id).await.unwrap();
    drop(first);

    let worker = Arc::new(ScriptedWorker::new());
    let second = executor_with_store(worker.clone(), store.clone(), contracts);
    let restored = second.restore(&run_id, &[]).await.unwrap();

    assert_eq!(restored.nodes, before.nodes);
    assert_eq!(restored.wave_count, 2);

    let state = second.run_to_completion(&run_id, 10).await.unwrap();
    assert_eq!(state.status, RunStatus::Succeeded);

    // only the remaining node ran after the restore
    let ran: Vec<String> = worker.calls().into_iter().map(|c| c.node_id).collect();
    assert_eq!(ran, vec!["review"]);
}

#[tokio::test]
async fn test_restore_with_forced_rerun() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let first = executor_with_store(Arc::new(ScriptedWorker::new()), store.clone(), registry());
    let run_id = first.submit(chain(3)).await.unwrap();
    first.run_to_completion(&run_id, 10).await.unwrap();

    let worker = Arc::new(ScriptedWorker::new());
    let second = executor_with_store(worker.clone(), store, registry());
    let restored = second
        .restore(&run_id, &["n2".to_string()])
        .await
        .unwrap();

    assert_eq!(restored.status, RunStatus::Running);
    assert_eq!(restored.node_status("n1"), Some(NodeStatus::Succeeded));
    assert_eq!(restored.node_status("n2"), Some(NodeStatus::Pending));
    assert_eq!(restored.node_status("n3"), Some(NodeStatus::Pending));

    second.run_to_completion(&run_id, 10).await.unwrap();
    let ran: Vec<String> = worker.calls().into_iter().map(|c| c.node_id).collect();
    assert_eq!(ran, vec!["n2", "n3"]);

    assert!(matches!(
        second.restore(&run_id, &["ghost".to_string()]).await,
        Err(EngineError::UnknownNode { .. })
    ));
}

#[tokio::test]
async fn test_empty_step_is_idempotent() {
    let executor = executor(Arc::new(ScriptedWorker::new()));
    let run_id = executor.submit(chain(1)).await.unwrap();
    executor.run_to_completion(&run_id, 5).await.unwrap();

    let before = executor.state(&run_id).await.unwrap();
    for _ in 0..3 {
        let wave = executor.step(&run_id).await.unwrap();
        assert!(wave.is_empty());
    }
    assert_eq!(executor.state(&run_id).await.unwrap(), before);
}

#[tokio::test]
async fn test_cycle_rejected_before_anything_runs() {
    let worker = Arc::new(ScriptedWorker::new());
    let store = Arc::new(MemoryStore::new());
    let executor = executor_with_store(worker.clone(), store.clone(), registry());

    let graph = WorkflowGraph::new("loop")
        .with_node("a", Node::action().depends_on(["c"]))
        .with_node("b", Node::action().depends_on(["a"]))
        .with_node("c", Node::action().depends_on(["b"]));

    let result = executor.submit(graph).await;
    assert!(matches!(result, Err(EngineError::GraphValidation(_))));
    assert!(worker.calls().is_empty());
    assert!(store.list_runs().await.unwrap().is_empty());
    assert!(executor.runs().await.is_empty());
}

#[tokio::test]
async fn test_persistence_failure_pauses_run() {
    let store = Arc::new(MemoryStore::new());
    let executor = executor_with_store(Arc::new(ScriptedWorker::new()), store.clone(), registry());
    let run_id = executor.submit(chain(2)).await.unwrap();

    store.fail_writes(true);
    let err = executor.step(&run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));

    let state = executor.state(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.count(NodeStatus::Ready), 0);
    assert_eq!(state.count(NodeStatus::Running), 0);

    // paused runs do not advance
    assert!(executor.step(&run_id).await.unwrap().is_empty());

    store.fail_writes(false);
    executor.resume(&run_id).await.unwrap();
    let state = executor.run_to_completion(&run_id, 5).await.unwrap();
    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(store.load_run(&run_id).await.unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_transient_failure_retried() {
    let graph = WorkflowGraph::new("retry").with_node("flaky", Node::action().with_retry(quick_retry(3)));
    let worker = Arc::new(ScriptedWorker::new().fail_attempt("flaky", 1));
    let executor = executor(worker.clone());

    let run_id = executor.submit(graph).await.unwrap();
    let state = executor.run_to_completion(&run_id, 5).await.unwrap();

    let node = state.node("flaky").unwrap();
    assert_eq!(node.status, NodeStatus::Succeeded);
    assert_eq!(node.attempts, 2);
    assert_eq!(node.history.len(), 2);
    assert!(node.error.is_none());
    assert_eq!(worker.calls_for("flaky").len(), 2);
}

#[tokio::test]
async fn test_node_timeout_fails_node() {
    let graph = WorkflowGraph::new("slow")
        .with_node("slow", Node::action().with_timeout(Duration::from_millis(10)));
    let worker = Arc::new(ScriptedWorker::new().with_delay("slow", Duration::from_millis(200)));
    let executor = executor(worker);

    let run_id = executor.submit(graph).await.unwrap();
    let err = executor.run_to_completion(&run_id, 5).await.unwrap_err();

    let state = err.run_state().unwrap();
    let node = state.node("slow").unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(node.error.as_ref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_cancel_mid_wave_lets_in_flight_work_finish() {
    let worker = Arc::new(ScriptedWorker::new().with_delay("n1", Duration::from_millis(150)));
    let executor = Arc::new(executor(worker.clone()));
    let run_id = executor.submit(chain(2)).await.unwrap();

    let stepping = {
        let executor = executor.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { executor.step(&run_id).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    executor.cancel(&run_id).await.unwrap();

    let wave = stepping.await.unwrap().unwrap();
    assert_eq!(wave.succeeded, vec!["n1"]);
    assert_eq!(wave.status, RunStatus::Cancelled);

    let state = executor.run_to_completion(&run_id, 5).await.unwrap();
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.node_status("n2"), Some(NodeStatus::Pending));
    assert!(worker.calls_for("n2").is_empty());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let worker = Arc::new(ScriptedWorker::new());
    let executor = executor(worker.clone());
    let run_id = executor.submit(chain(3)).await.unwrap();

    executor.step(&run_id).await.unwrap();
    executor.pause(&run_id).await.unwrap();

    let state = executor.run_to_completion(&run_id, 5).await.unwrap();
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(worker.calls().len(), 1);

    executor.resume(&run_id).await.unwrap();
    let state = executor.run_to_completion(&run_id, 5).await.unwrap();
    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(worker.calls().len(), 3);
}

#[tokio::test]
async fn test_breaking_evolution_reruns_consumers() {
    let contracts = registry_with_api().await;
    let worker = Arc::new(ScriptedWorker::new());
    let executor = executor_with_store(worker.clone(), Arc::new(MemoryStore::new()), contracts.clone());

    let run_id = executor.submit(implementation_graph()).await.unwrap();
    executor.run_to_completion(&run_id, 10).await.unwrap();

    let successor = contracts
        .write()
        .await
        .evolve(
            "api@1.0",
            ContractPayload(serde_json::json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            })),
        )
        .unwrap();
    assert_eq!(successor.id, "api@2.0");
    assert!(successor.breaking_changes);

    let reset = executor.schedule_revalidation(&run_id).await.unwrap();
    assert_eq!(reset, vec!["api", "build", "review"]);
    assert!(contracts.read().await.pending_revalidation().is_empty());

    let state = executor.run_to_completion(&run_id, 10).await.unwrap();
    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(worker.calls_for("api").len(), 2);
    assert_eq!(worker.calls_for("build").len(), 2);

    // the producer locked the successor before the consumer ran again
    let registry = contracts.read().await;
    let successor = registry.get("api@2.0").unwrap();
    assert_eq!(successor.status, ContractStatus::Active);
    assert!(successor.consumers.contains("build"));
    assert_eq!(
        registry.get("api@1.0").unwrap().status,
        ContractStatus::Deprecated
    );

    // the re-evaluation is recorded as a new iteration
    let iterations: Vec<u32> = state
        .outcomes_for(Phase::Implementation)
        .iter()
        .map(|o| o.iteration)
        .collect();
    assert_eq!(iterations, vec![1, 2]);
}

#[tokio::test]
async fn test_activate_contract_requires_succeeded_producer() {
    let contracts = registry_with_api().await;
    let executor = executor_with_store(
        Arc::new(ScriptedWorker::new()),
        Arc::new(MemoryStore::new()),
        contracts,
    );
    let run_id = executor.submit(implementation_graph()).await.unwrap();

    let err = executor.activate_contract(&run_id, "api@1.0").await.unwrap_err();
    assert!(matches!(err, EngineError::ContractConflict(_)));
}

#[tokio::test]
async fn test_checkpoint_without_metrics_scores_members() {
    let graph = WorkflowGraph::new("members")
        .with_node("work", Node::action().in_phase(Phase::Design))
        .with_node(
            "gate",
            Node::checkpoint().in_phase(Phase::Design).depends_on(["work"]),
        );
    let worker = Arc::new(
        ScriptedWorker::new()
            .always("work", metrics(1.0, 1.0, 1.0))
            .always("gate", NodeOutput::success()),
    );
    let executor = executor(worker);

    let run_id = executor.submit(graph).await.unwrap();
    let state = executor.run_to_completion(&run_id, 5).await.unwrap();

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.outcomes.len(), 1);
    assert_eq!(state.outcomes[0].verdict, Verdict::Pass);
    assert_eq!(
        state.outcomes[0].metrics,
        Some(QualityMetrics::new(1.0, 1.0, 1.0))
    );
}

#[tokio::test]
async fn test_executor_built_from_config() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_concurrency: NonZeroUsize::new(1),
        max_iterations: 1,
        state_dir: Some(dir.path().to_path_buf()),
        ..Config::default()
    };
    let worker = Arc::new(ScriptedWorker::new().always("review", metrics(0.1, 0.1, 0.1)));
    let executor = config
        .executor_builder(worker)
        .with_contracts(registry_with_api().await)
        .build();

    let run_id = executor.submit(implementation_graph()).await.unwrap();
    let err = executor.run_to_completion(&run_id, 10).await.unwrap_err();

    // a one-iteration budget leaves no room for rework
    match err {
        EngineError::GateBlocked { state, .. } => {
            let verdicts: Vec<Verdict> = state.outcomes.iter().map(|o| o.verdict).collect();
            assert_eq!(verdicts, vec![Verdict::Fail]);
        }
        other => panic!("expected GateBlocked, got {:?}", other),
    }
    assert!(dir
        .path()
        .join("runs")
        .join(format!("{}.json", run_id))
        .exists());
}

#[tokio::test]
async fn test_step_on_paused_run_changes_nothing() {
    let worker = Arc::new(ScriptedWorker::new());
    let executor = executor(worker.clone());
    let run_id = executor.submit(chain(3)).await.unwrap();

    executor.step(&run_id).await.unwrap();
    executor.pause(&run_id).await.unwrap();
    let before = executor.state(&run_id).await.unwrap();
    assert_eq!(before.status, RunStatus::Paused);

    for _ in 0..3 {
        let wave = executor.step(&run_id).await.unwrap();
        assert!(wave.is_empty());
        assert_eq!(wave.status, RunStatus::Paused);
    }
    assert_eq!(executor.state(&run_id).await.unwrap(), before);
    assert_eq!(worker.calls().len(), 1);
}

#[tokio::test]
async fn test_entry_blocked_run_stops_without_dispatch() {
    // the only ready node sits in a phase whose prerequisite never ran
    let graph = WorkflowGraph::new("blocked")
        .with_node("impl_work", Node::action().in_phase(Phase::Implementation))
        .with_node(
            "design_review",
            Node::checkpoint()
                .in_phase(Phase::Design)
                .depends_on(["impl_work"]),
        );
    let worker = Arc::new(ScriptedWorker::new());
    let executor = executor(worker.clone());
    let run_id = executor.submit(graph).await.unwrap();

    let first = executor.step(&run_id).await.unwrap();
    assert!(first.is_empty());
    assert_eq!(first.deferred, vec!["impl_work"]);
    assert_eq!(first.status, RunStatus::Failed);

    let before = executor.state(&run_id).await.unwrap();
    let failure = before.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Entry);
    assert_eq!(failure.phase, Some(Phase::Implementation));

    for _ in 0..2 {
        let wave = executor.step(&run_id).await.unwrap();
        assert!(wave.is_empty());
        assert!(wave.deferred.is_empty());
    }
    assert_eq!(executor.state(&run_id).await.unwrap(), before);
    assert!(worker.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_leaves_held_boundary_pending() {
    let graph = WorkflowGraph::new("gated")
        .with_node("work", Node::action().in_phase(Phase::Design))
        .with_node(
            "gate",
            Node::checkpoint().in_phase(Phase::Design).depends_on(["work"]),
        );
    let worker = Arc::new(ScriptedWorker::new().with_delay("gate", Duration::from_millis(150)));
    let executor = Arc::new(executor(worker.clone()));
    let run_id = executor.submit(graph).await.unwrap();
    executor.step(&run_id).await.unwrap();

    let stepping = {
        let executor = executor.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { executor.step(&run_id).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    executor.cancel(&run_id).await.unwrap();

    let wave = stepping.await.unwrap().unwrap();
    assert_eq!(wave.dispatched, vec!["gate"]);
    assert!(wave.gate_outcomes.is_empty());
    assert_eq!(wave.status, RunStatus::Cancelled);

    let state = executor.state(&run_id).await.unwrap();
    assert!(state.outcomes.is_empty());
    let gate = state.node("gate").unwrap();
    assert_eq!(gate.status, NodeStatus::Pending);
    assert_eq!(gate.history.len(), 1);
    assert_eq!(gate.history[0].outcome, AttemptOutcome::Succeeded);
    assert_eq!(worker.calls_for("gate").len(), 1);
}
