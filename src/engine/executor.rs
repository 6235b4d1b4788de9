// ABOUTME: Workflow executor driving runs wave by wave through phase gates
// ABOUTME: One writer per run; state is flushed after every terminal transition and gate decision

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::dependency::DependencyGraph;
use super::error::{EngineError, Result};
use super::machine::NodeEvent;
use super::scheduler::{DispatchTask, NodeRunReport, WaveScheduler};
use super::state::{
    AttemptOutcome, FailureKind, NodeExecution, NodeStatus, RunFailure, RunStatus,
    WorkflowRunState,
};
use super::worker::{CapabilityHint, CapabilityRouter, NodeRequest, NodeWorker};
use crate::contract::{Contract, ContractRegistry, ContractStatus, ProducerLedger, SharedRegistry};
use crate::gate::{
    GateCriterion, PhaseGateValidator, PhaseOutcome, PhaseScope, SeverityPolicy, ValidatorHook,
    Verdict,
};
use crate::graph::{GraphValidator, Phase, WorkflowGraph};
use crate::quality::{ProgressiveQualityManager, QualityConfig, QualityMetrics};
use crate::store::{MemoryStore, StateStore, StoreError};

pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(3600);

/// What one call to [`WorkflowExecutor::step`] did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveResult {
    pub wave: u32,
    pub dispatched: Vec<String>,
    pub interface_nodes: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Ready nodes held back by a failed entry gate
    pub deferred: Vec<String>,
    pub gate_outcomes: Vec<PhaseOutcome>,
    /// Run status once the step finished
    pub status: RunStatus,
}

impl WaveResult {
    fn new(wave: u32, status: RunStatus) -> Self {
        Self {
            wave,
            dispatched: Vec::new(),
            interface_nodes: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            deferred: Vec::new(),
            gate_outcomes: Vec::new(),
            status,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }
}

struct RunSlot {
    graph: WorkflowGraph,
    deps: DependencyGraph,
    state: WorkflowRunState,
}

struct RunHandle {
    slot: Mutex<RunSlot>,
    paused: AtomicBool,
    cancelled: Arc<AtomicBool>,
}

impl RunHandle {
    fn new(slot: RunSlot) -> Self {
        let paused = slot.state.status == RunStatus::Paused;
        let cancelled = slot.state.status == RunStatus::Cancelled;
        Self {
            slot: Mutex::new(slot),
            paused: AtomicBool::new(paused),
            cancelled: Arc::new(AtomicBool::new(cancelled)),
        }
    }
}

/// Bookkeeping for one step that is not part of the public result
#[derive(Default)]
struct StepProgress {
    /// Boundary nodes whose work succeeded and now await a verdict
    held: Vec<String>,
    newly_failed: Vec<String>,
    persist_error: Option<StoreError>,
}

pub struct ExecutorBuilder {
    worker: Arc<dyn NodeWorker>,
    router: Option<Arc<dyn CapabilityRouter>>,
    store: Option<Arc<dyn StateStore>>,
    contracts: Option<SharedRegistry>,
    quality: QualityConfig,
    policy: Option<Arc<dyn SeverityPolicy>>,
    hooks: Vec<(GateCriterion, Arc<dyn ValidatorHook>)>,
    max_concurrency: Option<NonZeroUsize>,
    default_timeout: Duration,
    max_iterations: u32,
}

impl ExecutorBuilder {
    pub fn with_router(mut self, router: Arc<dyn CapabilityRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_contracts(mut self, contracts: SharedRegistry) -> Self {
        self.contracts = Some(contracts);
        self
    }

    /// The config is taken as-is; call [`QualityConfig::validate`] first
    pub fn with_quality_config(mut self, config: QualityConfig) -> Self {
        self.quality = config;
        self
    }

    pub fn with_severity_policy(mut self, policy: Arc<dyn SeverityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_hook(mut self, criterion: GateCriterion, hook: Arc<dyn ValidatorHook>) -> Self {
        self.hooks.push((criterion, hook));
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: NonZeroUsize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> WorkflowExecutor {
        let contracts = self
            .contracts
            .unwrap_or_else(|| Arc::new(RwLock::new(ContractRegistry::new())));

        let mut gate = PhaseGateValidator::new(
            ProgressiveQualityManager::new(self.quality),
            Arc::clone(&contracts),
        )
        .with_max_iterations(self.max_iterations);
        if let Some(policy) = self.policy {
            gate = gate.with_policy(policy);
        }
        for (criterion, hook) in self.hooks {
            gate = gate.with_hook(criterion, hook);
        }

        WorkflowExecutor {
            worker: self.worker,
            router: self.router,
            scheduler: WaveScheduler::new(self.max_concurrency),
            gate,
            contracts,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            default_timeout: self.default_timeout,
            runs: RwLock::new(HashMap::new()),
        }
    }
}

pub struct WorkflowExecutor {
    worker: Arc<dyn NodeWorker>,
    router: Option<Arc<dyn CapabilityRouter>>,
    scheduler: WaveScheduler,
    gate: PhaseGateValidator,
    contracts: SharedRegistry,
    store: Arc<dyn StateStore>,
    default_timeout: Duration,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl WorkflowExecutor {
    pub fn builder(worker: Arc<dyn NodeWorker>) -> ExecutorBuilder {
        ExecutorBuilder {
            worker,
            router: None,
            store: None,
            contracts: None,
            quality: QualityConfig::default(),
            policy: None,
            hooks: Vec::new(),
            max_concurrency: None,
            default_timeout: DEFAULT_NODE_TIMEOUT,
            max_iterations: crate::gate::validator::DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn contracts(&self) -> SharedRegistry {
        Arc::clone(&self.contracts)
    }

    pub fn gate(&self) -> &PhaseGateValidator {
        &self.gate
    }

    /// Validate and persist a graph, returning the id of its new run
    #[instrument(skip(self, graph), fields(graph_id = %graph.id))]
    pub async fn submit(&self, graph: WorkflowGraph) -> Result<String> {
        let warnings = GraphValidator::new().validate(&graph).into_result()?;
        for warning in &warnings {
            warn!("Graph {}: {}", graph.id, warning);
        }

        let deps = DependencyGraph::from_graph(&graph)?;
        let run_id = Uuid::new_v4().to_string();
        let state = WorkflowRunState::new(&run_id, &graph);

        self.store.save_graph(&graph).await?;
        self.store.save_run(&state).await?;

        info!(
            "Submitted graph {} as run {} ({} nodes, phases: {:?})",
            graph.id,
            run_id,
            graph.nodes.len(),
            state.phases
        );

        let handle = Arc::new(RunHandle::new(RunSlot { graph, deps, state }));
        self.runs.write().await.insert(run_id.clone(), handle);
        Ok(run_id)
    }

    /// Dispatch the next wave of ready nodes and settle its gates
    #[instrument(skip(self))]
    pub async fn step(&self, run_id: &str) -> Result<WaveResult> {
        let handle = self.handle(run_id).await?;
        let mut guard = handle.slot.lock().await;
        let RunSlot { graph, deps, state } = &mut *guard;

        let mut wave = WaveResult::new(state.wave_count, state.status);
        let mut progress = StepProgress::default();

        if state.status != RunStatus::Running {
            return Ok(wave);
        }

        if self.observe_control_flags(&handle, state) {
            self.flush(state, &mut progress.persist_error).await;
            return self.conclude(&handle, state, wave, progress);
        }

        let ready = deps.ready_nodes(state);
        if ready.is_empty() {
            if self.finalize_if_settled(deps, state) {
                self.flush(state, &mut progress.persist_error).await;
            }
            return self.conclude(&handle, state, wave, progress);
        }

        let (dispatch, blocked) = self.admit(graph, state, ready, &mut wave);
        if dispatch.is_empty() {
            let (phase, reason) = blocked.unwrap_or((Phase::Requirements, String::new()));
            error!("Run {} blocked at entry to {}: {}", run_id, phase, reason);
            state.failure = Some(RunFailure {
                kind: FailureKind::Entry,
                phase: Some(phase),
                message: reason,
            });
            state.finish(RunStatus::Failed);
            self.flush(state, &mut progress.persist_error).await;
            return self.conclude(&handle, state, wave, progress);
        }

        state.wave_count += 1;
        wave.wave = state.wave_count;
        for node_id in &dispatch {
            node_mut(state, node_id)?.apply(NodeEvent::MarkReady)?;
        }

        let (interfaces, others): (Vec<String>, Vec<String>) =
            dispatch.iter().cloned().partition(|id| deps.is_interface(id));
        info!(
            "Run {} wave {}: {} interface, {} other node(s)",
            run_id,
            wave.wave,
            interfaces.len(),
            others.len()
        );
        wave.dispatched = dispatch;
        wave.interface_nodes = interfaces.clone();

        // Interface barrier: nothing else in the wave starts until every
        // interface node is terminal and its contract is locked.
        if !interfaces.is_empty() {
            self.register_consumers(graph, &interfaces).await;
            self.run_batch(&handle, graph, deps, state, &interfaces, &mut wave, &mut progress)
                .await?;
            self.lock_interface_contracts(graph, state, &interfaces)
                .await;
        }

        let failed_contracts = failed_interface_contracts(graph, state);
        let mut runnable = Vec::new();
        for node_id in others {
            if state.node_status(&node_id) != Some(NodeStatus::Ready) {
                continue;
            }
            let consumes_failed = graph.node(&node_id).is_some_and(|node| {
                node.consumes_contracts
                    .iter()
                    .any(|name| failed_contracts.contains(name))
            });
            if consumes_failed {
                info!("Skipping {}: its interface contract was never locked", node_id);
                node_mut(state, &node_id)?.apply(NodeEvent::Skip)?;
                wave.skipped.push(node_id.clone());
                wave.skipped.extend(skip_descendants(deps, state, &node_id)?);
                self.flush(state, &mut progress.persist_error).await;
            } else {
                runnable.push(node_id);
            }
        }

        if progress.persist_error.is_none() && !runnable.is_empty() {
            // after lockdown, so same-wave consumers bind to the fresh ACTIVE version
            self.register_consumers(graph, &runnable).await;
            self.run_batch(&handle, graph, deps, state, &runnable, &mut wave, &mut progress)
                .await?;
        }

        if progress.persist_error.is_some() {
            return self.conclude(&handle, state, wave, progress);
        }

        // Cancelled runs skip gate evaluation. Held boundaries go back to
        // PENDING with their attempt history intact.
        if handle.cancelled.load(Ordering::SeqCst) {
            for boundary in std::mem::take(&mut progress.held) {
                info!("Gate for {} not evaluated: run cancelled", boundary);
                node_mut(state, &boundary)?.apply(NodeEvent::Reset)?;
            }
        }

        let mut failed_phases = BTreeSet::new();
        for boundary in std::mem::take(&mut progress.held) {
            let outcome = self.evaluate_boundary(graph, deps, state, &boundary).await?;
            if outcome.verdict == Verdict::Fail {
                failed_phases.insert(outcome.phase);
            }
            wave.gate_outcomes.push(outcome);
            self.flush(state, &mut progress.persist_error).await;
        }

        let member_failures: BTreeSet<Phase> = progress
            .newly_failed
            .iter()
            .filter_map(|id| graph.node(id).and_then(|node| node.phase))
            .filter(|phase| graph.boundary_for(*phase).is_some())
            .collect();
        for phase in member_failures.difference(&failed_phases) {
            if handle.cancelled.load(Ordering::SeqCst) {
                break;
            }
            if let Some(outcome) = self.fail_phase(graph, deps, state, *phase)? {
                wave.gate_outcomes.push(outcome);
                self.flush(state, &mut progress.persist_error).await;
            }
        }

        self.observe_control_flags(&handle, state);
        self.finalize_if_settled(deps, state);
        state.touch();
        self.flush(state, &mut progress.persist_error).await;

        self.conclude(&handle, state, wave, progress)
    }

    /// Step until the run stops being RUNNING or `max_waves` steps were taken.
    /// Terminal failures come back as errors carrying the full run state.
    #[instrument(skip(self))]
    pub async fn run_to_completion(&self, run_id: &str, max_waves: usize) -> Result<WorkflowRunState> {
        for _ in 0..max_waves {
            let wave = self.step(run_id).await?;
            if wave.status != RunStatus::Running {
                break;
            }
        }

        let state = self.state(run_id).await?;
        if state.status != RunStatus::Failed {
            info!("Run {} stopped with status {}", run_id, state.status);
            return Ok(state);
        }

        match state.failure.clone() {
            Some(RunFailure {
                kind: FailureKind::Gate | FailureKind::Entry,
                phase: Some(phase),
                message,
            }) => Err(EngineError::GateBlocked {
                phase,
                reason: message,
                state: Box::new(state),
            }),
            failure => Err(EngineError::RunFailed {
                run_id: run_id.to_string(),
                reason: failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| "run failed".to_string()),
                state: Box::new(state),
            }),
        }
    }

    /// Stop dispatching new waves. In-flight work finishes.
    pub async fn pause(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        handle.paused.store(true, Ordering::SeqCst);

        if let Ok(mut slot) = handle.slot.try_lock() {
            let state = &mut slot.state;
            if state.status.is_finished() {
                handle.paused.store(false, Ordering::SeqCst);
                return Err(invalid_state(state, "pause"));
            }
            if state.status == RunStatus::Running {
                state.status = RunStatus::Paused;
                state.touch();
                self.store.save_run(state).await?;
            }
        }

        info!("Pause requested for run {}", run_id);
        Ok(())
    }

    pub async fn resume(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        let mut slot = handle.slot.lock().await;
        let state = &mut slot.state;

        if !matches!(state.status, RunStatus::Paused | RunStatus::Running) {
            return Err(invalid_state(state, "resume"));
        }

        handle.paused.store(false, Ordering::SeqCst);
        state.status = RunStatus::Running;
        state.touch();
        self.store.save_run(state).await?;

        info!("Resumed run {}", run_id);
        Ok(())
    }

    /// No new waves and no further retries. In-flight work finishes.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let handle = self.handle(run_id).await?;
        handle.cancelled.store(true, Ordering::SeqCst);

        if let Ok(mut slot) = handle.slot.try_lock() {
            let state = &mut slot.state;
            if state.status.is_finished() {
                return Err(invalid_state(state, "cancel"));
            }
            state.finish(RunStatus::Cancelled);
            self.store.save_run(state).await?;
        }

        info!("Cancel requested for run {}", run_id);
        Ok(())
    }

    /// Reload a run persisted by any executor. Unfinished READY/RUNNING work
    /// is redone; `force_rerun` ids and everything downstream of them too.
    #[instrument(skip(self))]
    pub async fn restore(&self, run_id: &str, force_rerun: &[String]) -> Result<WorkflowRunState> {
        let mut state = self.store.load_run(run_id).await?;
        let graph = self.store.load_graph(&state.graph_id).await?;
        let deps = DependencyGraph::from_graph(&graph)?;

        for node in state.nodes.values_mut() {
            if matches!(node.status, NodeStatus::Ready | NodeStatus::Running) {
                node.apply(NodeEvent::Reset)?;
            }
        }

        let mut rerun = Vec::new();
        for node_id in force_rerun {
            if !state.nodes.contains_key(node_id) {
                return Err(EngineError::UnknownNode {
                    run_id: run_id.to_string(),
                    node_id: node_id.clone(),
                });
            }
            rerun.extend(reset_with_descendants(&deps, &mut state, node_id)?);
        }

        if !rerun.is_empty() {
            info!("Forced re-run of {:?} in run {}", rerun, run_id);
            reopen(&mut state);
        }

        state.touch();
        self.store.save_run(&state).await?;

        let snapshot = state.clone();
        let handle = Arc::new(RunHandle::new(RunSlot { graph, deps, state }));
        self.runs.write().await.insert(run_id.to_string(), handle);

        info!("Restored run {} with status {}", run_id, snapshot.status);
        Ok(snapshot)
    }

    /// Reset consumers flagged by breaking contract evolutions, and their
    /// dependents. While the successor is still DRAFT its producer is reset
    /// as well, so the new version is locked before the consumers run again.
    /// Phases re-gated this way move to their next iteration.
    pub async fn schedule_revalidation(&self, run_id: &str) -> Result<Vec<String>> {
        let handle = self.handle(run_id).await?;
        let mut guard = handle.slot.lock().await;
        let RunSlot { graph, deps, state } = &mut *guard;

        let mut restart: Vec<String> = Vec::new();
        {
            let mut registry = self.contracts.write().await;
            let requests = registry
                .take_revalidation_where(|request| graph.nodes.contains_key(&request.consumer));

            for request in &requests {
                info!(
                    "Re-validating {} after {} superseded {}",
                    request.consumer, request.successor_id, request.contract_id
                );
                let producer = registry
                    .get(&request.successor_id)
                    .filter(|successor| successor.status == ContractStatus::Draft)
                    .map(|successor| successor.producer.clone());
                match producer {
                    Some(producer) if graph.nodes.contains_key(&producer) => {
                        if !restart.contains(&producer) {
                            restart.push(producer);
                        }
                    }
                    Some(producer) => warn!(
                        "Producer {} of {} is outside run {}; {} re-runs against the ACTIVE version",
                        producer, request.successor_id, run_id, request.consumer
                    ),
                    None => {}
                }
                if !restart.contains(&request.consumer) {
                    restart.push(request.consumer.clone());
                }
            }
        }

        let mut touched: HashSet<String> = HashSet::new();
        for node_id in &restart {
            touched.extend(reset_with_descendants(deps, state, node_id)?);
        }
        let reset: Vec<String> = graph
            .nodes
            .keys()
            .filter(|id| touched.contains(*id))
            .cloned()
            .collect();

        if !reset.is_empty() {
            for phase in state.phases.clone() {
                let regated = graph
                    .boundary_for(phase)
                    .is_some_and(|boundary| touched.contains(boundary));
                let evaluated = state
                    .latest_outcome(phase)
                    .is_some_and(|outcome| outcome.iteration == state.iteration(phase));
                if regated && evaluated {
                    let next = state.iteration(phase) + 1;
                    info!("Phase {} re-gated at iteration {}", phase, next);
                    state.iterations.insert(phase, next);
                }
            }
            reopen(state);
            state.touch();
            self.store.save_run(state).await?;
        }
        Ok(reset)
    }

    /// Lock a DRAFT contract against this run's node outcomes
    pub async fn activate_contract(&self, run_id: &str, contract_id: &str) -> Result<Contract> {
        let handle = self.handle(run_id).await?;
        let slot = handle.slot.lock().await;
        let contract = self
            .contracts
            .write()
            .await
            .activate(contract_id, &slot.state)?;
        Ok(contract)
    }

    pub async fn state(&self, run_id: &str) -> Result<WorkflowRunState> {
        let handle = self.handle(run_id).await?;
        let slot = handle.slot.lock().await;
        Ok(slot.state.clone())
    }

    pub async fn runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.runs.read().await.keys().cloned().collect();
        runs.sort();
        runs
    }

    async fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Split ready nodes into admitted and deferred by running each phase's
    /// entry gate the first time one of its nodes would be dispatched
    fn admit(
        &self,
        graph: &WorkflowGraph,
        state: &mut WorkflowRunState,
        ready: Vec<String>,
        wave: &mut WaveResult,
    ) -> (Vec<String>, Option<(Phase, String)>) {
        let mut checked: HashMap<Phase, bool> = HashMap::new();
        let mut blocked = None;
        let mut dispatch = Vec::new();

        for node_id in ready {
            let phase = graph.node(&node_id).and_then(|node| node.phase);
            let admitted = match phase {
                Some(phase) if !state.entered_phases.contains(&phase) => {
                    *checked.entry(phase).or_insert_with(|| {
                        let entry = self.gate.validate_entry(phase, state);
                        if !entry.passed() && blocked.is_none() {
                            let reason = entry
                                .blocking_issues
                                .iter()
                                .map(|issue| issue.message.clone())
                                .collect::<Vec<_>>()
                                .join("; ");
                            warn!("Entry gate for {} failed: {}", phase, reason);
                            blocked = Some((phase, reason));
                        }
                        entry.passed()
                    })
                }
                _ => true,
            };

            if admitted {
                dispatch.push(node_id);
            } else {
                wave.deferred.push(node_id);
            }
        }

        for (phase, open) in checked {
            if open {
                info!("Entered phase {}", phase);
                state.entered_phases.insert(phase);
            }
        }

        (dispatch, blocked)
    }

    async fn register_consumers(&self, graph: &WorkflowGraph, node_ids: &[String]) {
        let consumers: Vec<(&String, &String)> = node_ids
            .iter()
            .filter_map(|id| graph.node(id).map(|node| (id, node)))
            .flat_map(|(id, node)| node.consumes_contracts.iter().map(move |name| (id, name)))
            .collect();
        if consumers.is_empty() {
            return;
        }

        let mut registry = self.contracts.write().await;
        for (node_id, name) in consumers {
            let Some(contract_id) = registry.active_version(name).map(|c| c.id.clone()) else {
                debug!("{} consumes {} which has no ACTIVE version yet", node_id, name);
                continue;
            };
            if let Err(e) = registry.register_consumer(&contract_id, node_id) {
                warn!("Could not register {} on {}: {}", node_id, contract_id, e);
            }
        }
    }

    /// Lockdown of contracts produced by interface nodes that just succeeded
    async fn lock_interface_contracts(
        &self,
        graph: &WorkflowGraph,
        state: &WorkflowRunState,
        interfaces: &[String],
    ) {
        let mut registry = self.contracts.write().await;
        for node_id in interfaces {
            if !state.has_succeeded(node_id) {
                continue;
            }
            let Some(name) = graph.node(node_id).and_then(|n| n.locks_contract.as_ref()) else {
                continue;
            };
            let Some(draft_id) = registry.draft_version(name).map(|c| c.id.clone()) else {
                if registry.active_version(name).is_none() {
                    warn!("Interface {} succeeded but {} has no DRAFT to lock", node_id, name);
                }
                continue;
            };

            match registry.activate(&draft_id, state) {
                Ok(contract) => info!("Interface {} locked {}", node_id, contract.id),
                Err(e) => warn!("Lockdown after {} rejected: {}", node_id, e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        handle: &RunHandle,
        graph: &WorkflowGraph,
        deps: &DependencyGraph,
        state: &mut WorkflowRunState,
        node_ids: &[String],
        wave: &mut WaveResult,
        progress: &mut StepProgress,
    ) -> Result<()> {
        let tasks = self.build_tasks(graph, state, node_ids).await;
        let mut reports = self
            .scheduler
            .execute_batch(tasks, &self.worker, &handle.cancelled)
            .await;
        reports.sort_by_key(|r| {
            node_ids
                .iter()
                .position(|id| *id == r.node_id)
                .unwrap_or(usize::MAX)
        });

        for report in reports {
            let node_id = report.node_id.clone();
            let hold = graph.node(&node_id).is_some_and(|node| node.is_boundary());

            match replay(state, &node_id, report, hold)? {
                NodeStatus::Succeeded => wave.succeeded.push(node_id),
                NodeStatus::Running => progress.held.push(node_id),
                NodeStatus::Failed => {
                    warn!("Node {} failed terminally", node_id);
                    wave.failed.push(node_id.clone());
                    wave.skipped.extend(skip_descendants(deps, state, &node_id)?);
                    progress.newly_failed.push(node_id);
                }
                status => debug!("Node {} left {} after dispatch", node_id, status),
            }

            state.touch();
            self.flush(state, &mut progress.persist_error).await;
        }

        Ok(())
    }

    async fn build_tasks(
        &self,
        graph: &WorkflowGraph,
        state: &WorkflowRunState,
        node_ids: &[String],
    ) -> Vec<DispatchTask> {
        let mut tasks = Vec::new();

        for node_id in node_ids {
            let Some(node) = graph.node(node_id) else {
                continue;
            };

            let inputs = node
                .depends_on
                .iter()
                .map(|dep| {
                    let artifacts = state
                        .node(dep)
                        .map(|n| n.artifacts.clone())
                        .unwrap_or_default();
                    (dep.clone(), artifacts)
                })
                .collect();

            let capability_hint = match &self.router {
                Some(router) => CapabilityHint::Ranked(router.rank_candidates(&node.capabilities).await),
                None => CapabilityHint::Tags(node.capabilities.clone()),
            };

            tasks.push(DispatchTask {
                request: NodeRequest {
                    run_id: state.run_id.clone(),
                    node_id: node_id.clone(),
                    kind: node.kind,
                    phase: node.phase,
                    iteration: node.phase.map(|p| state.iteration(p)).unwrap_or(1),
                    attempt: 1,
                    inputs,
                    capability_hint,
                },
                retry: node.retry_policy(),
                timeout: node.timeout.unwrap_or(self.default_timeout),
            });
        }

        tasks
    }

    /// Exit gate for a boundary node whose own work succeeded
    async fn evaluate_boundary(
        &self,
        graph: &WorkflowGraph,
        deps: &DependencyGraph,
        state: &mut WorkflowRunState,
        boundary: &str,
    ) -> Result<PhaseOutcome> {
        let scope = graph
            .node(boundary)
            .and_then(|node| node.phase)
            .and_then(|phase| PhaseScope::from_graph(graph, phase, state))
            .ok_or_else(|| EngineError::UnknownNode {
                run_id: state.run_id.clone(),
                node_id: boundary.to_string(),
            })?;
        let metrics = phase_metrics(state, &scope);

        let outcome = self.gate.validate_exit(&scope, &metrics, state).await;
        let phase = scope.phase;

        match outcome.verdict {
            Verdict::Pass => {
                let node = node_mut(state, boundary)?;
                node.apply(NodeEvent::Succeed)?;
                info!("Phase {} passed at iteration {}", phase, outcome.iteration);
            }
            Verdict::Rework => {
                let targets = rework_targets(graph, deps, &scope, &outcome);
                info!(
                    "Phase {} sent to rework (iteration {} -> {}): {:?}",
                    phase,
                    outcome.iteration,
                    outcome.iteration + 1,
                    targets
                );
                for node_id in &targets {
                    node_mut(state, node_id)?.apply(NodeEvent::Reset)?;
                }
                state.iterations.insert(phase, outcome.iteration + 1);
            }
            Verdict::Fail => {
                abort_phase(graph, deps, state, &scope)?;
                state.failure = Some(RunFailure {
                    kind: FailureKind::Gate,
                    phase: Some(phase),
                    message: describe_issues(&outcome),
                });
                state.finish(RunStatus::Failed);
                error!("Phase {} failed: {}", phase, describe_issues(&outcome));
            }
        }

        state.outcomes.push(outcome.clone());
        Ok(outcome)
    }

    /// Record a FAIL outcome for a phase whose member failed terminally
    fn fail_phase(
        &self,
        graph: &WorkflowGraph,
        deps: &DependencyGraph,
        state: &mut WorkflowRunState,
        phase: Phase,
    ) -> Result<Option<PhaseOutcome>> {
        let Some(scope) = PhaseScope::from_graph(graph, phase, state) else {
            return Ok(None);
        };

        let outcome = self.gate.fail_phase(&scope, state);
        abort_phase(graph, deps, state, &scope)?;

        if state.status == RunStatus::Running {
            state.failure = Some(RunFailure {
                kind: FailureKind::Gate,
                phase: Some(phase),
                message: describe_issues(&outcome),
            });
            state.finish(RunStatus::Failed);
        }

        state.outcomes.push(outcome.clone());
        Ok(Some(outcome))
    }

    /// Apply pending pause/cancel requests. Returns true if the run stopped.
    fn observe_control_flags(&self, handle: &RunHandle, state: &mut WorkflowRunState) -> bool {
        if state.status != RunStatus::Running {
            return true;
        }
        if handle.cancelled.load(Ordering::SeqCst) {
            info!("Run {} cancelled", state.run_id);
            state.finish(RunStatus::Cancelled);
            return true;
        }
        if handle.paused.load(Ordering::SeqCst) {
            info!("Run {} paused", state.run_id);
            state.status = RunStatus::Paused;
            state.touch();
            return true;
        }
        false
    }

    /// Close out a RUNNING run once nothing can be dispatched any more.
    /// Returns true if the state changed.
    fn finalize_if_settled(&self, deps: &DependencyGraph, state: &mut WorkflowRunState) -> bool {
        if state.status != RunStatus::Running {
            return false;
        }

        if state.all_terminal() {
            let failed = state.nodes_with_status(NodeStatus::Failed);
            if failed.is_empty() {
                info!("Run {} succeeded", state.run_id);
                state.finish(RunStatus::Succeeded);
            } else {
                state.failure.get_or_insert_with(|| RunFailure {
                    kind: FailureKind::Node,
                    phase: None,
                    message: format!("node(s) failed: {}", failed.join(", ")),
                });
                error!("Run {} failed: {:?}", state.run_id, failed);
                state.finish(RunStatus::Failed);
            }
            return true;
        }

        let in_flight = state.count(NodeStatus::Ready) + state.count(NodeStatus::Running);
        if in_flight == 0 && deps.ready_nodes(state).is_empty() {
            let waiting = state.nodes_with_status(NodeStatus::Pending);
            error!("Run {} stalled with pending nodes {:?}", state.run_id, waiting);
            state.failure = Some(RunFailure {
                kind: FailureKind::Node,
                phase: None,
                message: format!("no runnable nodes remain; pending: {}", waiting.join(", ")),
            });
            state.finish(RunStatus::Failed);
            return true;
        }

        false
    }

    async fn flush(&self, state: &WorkflowRunState, persist_error: &mut Option<StoreError>) {
        if let Err(e) = self.store.save_run(state).await {
            error!("Failed to persist run {}: {}", state.run_id, e);
            persist_error.get_or_insert(e);
        }
    }

    /// A failed flush pauses the run: unpersisted in-flight work is redone
    /// after resume
    fn conclude(
        &self,
        handle: &RunHandle,
        state: &mut WorkflowRunState,
        mut wave: WaveResult,
        progress: StepProgress,
    ) -> Result<WaveResult> {
        if let Some(e) = progress.persist_error {
            if !state.status.is_finished() {
                for node in state.nodes.values_mut() {
                    if matches!(node.status, NodeStatus::Ready | NodeStatus::Running) {
                        node.apply(NodeEvent::Reset)?;
                    }
                }
                state.status = RunStatus::Paused;
                handle.paused.store(true, Ordering::SeqCst);
                warn!("Run {} paused after persistence failure", state.run_id);
            }
            return Err(EngineError::Persistence(e));
        }

        wave.status = state.status;
        Ok(wave)
    }
}

fn node_mut<'a>(state: &'a mut WorkflowRunState, node_id: &str) -> Result<&'a mut NodeExecution> {
    let run_id = state.run_id.clone();
    state
        .nodes
        .get_mut(node_id)
        .ok_or_else(|| EngineError::UnknownNode {
            run_id,
            node_id: node_id.to_string(),
        })
}

fn invalid_state(state: &WorkflowRunState, action: &str) -> EngineError {
    EngineError::InvalidRunState {
        run_id: state.run_id.clone(),
        status: state.status,
        action: action.to_string(),
    }
}

/// Fold a dispatch report into the node's state machine. A boundary node
/// that succeeded is held RUNNING until its gate verdict.
fn replay(
    state: &mut WorkflowRunState,
    node_id: &str,
    report: NodeRunReport,
    hold: bool,
) -> Result<NodeStatus> {
    let node = node_mut(state, node_id)?;

    if report.attempts.is_empty() {
        node.apply(NodeEvent::Start)?;
        node.apply(NodeEvent::Fail { retry: false })?;
        node.error = report.error.map(|e| e.to_string());
        return Ok(node.status);
    }

    let succeeded = report.succeeded();
    let total = report.attempts.len();
    for (index, record) in report.attempts.into_iter().enumerate() {
        node.apply(NodeEvent::Start)?;
        if index == 0 {
            node.started_at = Some(record.started_at);
        }

        if record.outcome == AttemptOutcome::Succeeded {
            if !hold {
                node.apply(NodeEvent::Succeed)?;
                node.finished_at = Some(record.finished_at);
            }
        } else {
            let retry = index + 1 < total;
            node.apply(NodeEvent::Fail { retry })?;
            if !retry {
                node.finished_at = Some(record.finished_at);
            }
        }
        node.history.push(record);
    }

    if let Some(output) = report.output {
        node.artifacts = output.artifacts;
        node.metrics = output.metrics;
    }
    node.error = if succeeded {
        None
    } else {
        report.error.map(|e| e.to_string())
    };

    Ok(node.status)
}

fn skip_descendants(
    deps: &DependencyGraph,
    state: &mut WorkflowRunState,
    node_id: &str,
) -> Result<Vec<String>> {
    let mut skipped = Vec::new();
    for descendant in deps.descendants(node_id) {
        let node = node_mut(state, &descendant)?;
        if matches!(node.status, NodeStatus::Pending | NodeStatus::Ready) {
            node.apply(NodeEvent::Skip)?;
            skipped.push(descendant);
        }
    }
    if !skipped.is_empty() {
        info!("Skipped downstream of {}: {:?}", node_id, skipped);
    }
    Ok(skipped)
}

fn reset_with_descendants(
    deps: &DependencyGraph,
    state: &mut WorkflowRunState,
    node_id: &str,
) -> Result<Vec<String>> {
    let mut reset = Vec::new();
    for id in std::iter::once(node_id.to_string()).chain(deps.descendants(node_id)) {
        let node = node_mut(state, &id)?;
        if node.status != NodeStatus::Pending {
            node.apply(NodeEvent::Reset)?;
            reset.push(id);
        }
    }
    Ok(reset)
}

/// Implicated nodes, the phase nodes downstream of them, and the boundary,
/// in declaration order
fn rework_targets(
    graph: &WorkflowGraph,
    deps: &DependencyGraph,
    scope: &PhaseScope,
    outcome: &PhaseOutcome,
) -> Vec<String> {
    let phase_nodes: HashSet<&str> = scope
        .members
        .iter()
        .chain(std::iter::once(&scope.boundary))
        .map(String::as_str)
        .collect();

    let mut targets: HashSet<String> = HashSet::new();
    for implicated in outcome.implicated_nodes() {
        for downstream in deps.descendants(&implicated) {
            if phase_nodes.contains(downstream.as_str()) {
                targets.insert(downstream);
            }
        }
        targets.insert(implicated);
    }
    targets.insert(scope.boundary.clone());

    graph
        .nodes
        .keys()
        .filter(|id| targets.contains(*id))
        .cloned()
        .collect()
}

/// Phase and everything downstream of its boundary end FAILED
fn abort_phase(
    graph: &WorkflowGraph,
    deps: &DependencyGraph,
    state: &mut WorkflowRunState,
    scope: &PhaseScope,
) -> Result<()> {
    let doomed: Vec<String> = scope
        .members
        .iter()
        .cloned()
        .chain(std::iter::once(scope.boundary.clone()))
        .chain(deps.descendants(&scope.boundary))
        .collect();

    for node_id in graph.nodes.keys().filter(|id| doomed.contains(id)) {
        let node = node_mut(state, node_id)?;
        if !node.status.is_terminal() {
            node.apply(NodeEvent::Abort)?;
        }
    }
    Ok(())
}

/// Metrics reported by the boundary, else the mean of what the phase's
/// members reported
fn phase_metrics(state: &WorkflowRunState, scope: &PhaseScope) -> QualityMetrics {
    if let Some(metrics) = state.node(&scope.boundary).and_then(|node| node.metrics) {
        return metrics;
    }

    let reported: Vec<QualityMetrics> = scope
        .members
        .iter()
        .filter_map(|id| state.node(id).and_then(|node| node.metrics))
        .collect();
    QualityMetrics::mean(&reported).unwrap_or_else(|| {
        warn!("No metrics reported for phase {}", scope.phase);
        QualityMetrics::default()
    })
}

fn failed_interface_contracts(graph: &WorkflowGraph, state: &WorkflowRunState) -> HashSet<String> {
    graph
        .nodes
        .iter()
        .filter(|(id, node)| {
            node.is_interface() && state.node_status(id) == Some(NodeStatus::Failed)
        })
        .filter_map(|(_, node)| node.locks_contract.clone())
        .collect()
}

fn reopen(state: &mut WorkflowRunState) {
    if state.status.is_finished() && state.status != RunStatus::Cancelled {
        state.status = RunStatus::Running;
        state.failure = None;
        state.finished_at = None;
    }
}

fn describe_issues(outcome: &PhaseOutcome) -> String {
    outcome
        .blocking_issues
        .iter()
        .map(|issue| issue.message.clone())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NodeOutput;
    use crate::graph::Node;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct EchoWorker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NodeWorker for EchoWorker {
        async fn execute_node(&self, request: NodeRequest) -> NodeOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.node_id.starts_with("broken") {
                return NodeOutput::failure("boom");
            }
            NodeOutput::success().with_metrics(QualityMetrics::new(1.0, 1.0, 1.0))
        }
    }

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::builder(Arc::new(EchoWorker {
            calls: AtomicU32::new(0),
        }))
        .build()
    }

    fn chain() -> WorkflowGraph {
        WorkflowGraph::new("chain")
            .with_node("a", Node::action())
            .with_node("b", Node::action().depends_on(["a"]))
    }

    #[tokio::test]
    async fn test_submit_rejects_cycles() {
        let graph = WorkflowGraph::new("cycle")
            .with_node("a", Node::action().depends_on(["b"]))
            .with_node("b", Node::action().depends_on(["a"]));

        let result = executor().submit(graph).await;
        assert!(matches!(result, Err(EngineError::GraphValidation(_))));
    }

    #[tokio::test]
    async fn test_chain_runs_wave_by_wave() {
        let executor = executor();
        let run_id = executor.submit(chain()).await.unwrap();

        let first = executor.step(&run_id).await.unwrap();
        assert_eq!(first.wave, 1);
        assert_eq!(first.succeeded, vec!["a"]);
        assert_eq!(first.status, RunStatus::Running);

        let second = executor.step(&run_id).await.unwrap();
        assert_eq!(second.succeeded, vec!["b"]);
        assert_eq!(second.status, RunStatus::Succeeded);

        let state = executor.state(&run_id).await.unwrap();
        assert_eq!(state.wave_count, 2);
        assert!(state.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_step_after_finish_is_a_no_op() {
        let executor = executor();
        let run_id = executor.submit(chain()).await.unwrap();
        executor.run_to_completion(&run_id, 10).await.unwrap();

        let before = executor.state(&run_id).await.unwrap();
        let wave = executor.step(&run_id).await.unwrap();
        let after = executor.state(&run_id).await.unwrap();

        assert!(wave.is_empty());
        assert_eq!(wave.status, RunStatus::Succeeded);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_failed_node_skips_descendants() {
        let graph = WorkflowGraph::new("broken")
            .with_node("broken", Node::action())
            .with_node("after", Node::action().depends_on(["broken"]))
            .with_node("aside", Node::action());

        let executor = executor();
        let run_id = executor.submit(graph).await.unwrap();
        let wave = executor.step(&run_id).await.unwrap();

        assert_eq!(wave.failed, vec!["broken"]);
        assert_eq!(wave.skipped, vec!["after"]);
        assert_eq!(wave.status, RunStatus::Failed);

        let err = executor.run_to_completion(&run_id, 5).await.unwrap_err();
        let state = err.run_state().unwrap();
        assert_eq!(state.node_status("aside"), Some(NodeStatus::Succeeded));
        assert_eq!(state.failure.as_ref().unwrap().kind, FailureKind::Node);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let executor = executor();
        assert!(matches!(
            executor.step("missing").await,
            Err(EngineError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_finished_run() {
        let executor = executor();
        let run_id = executor.submit(chain()).await.unwrap();
        executor.run_to_completion(&run_id, 10).await.unwrap();

        assert!(matches!(
            executor.resume(&run_id).await,
            Err(EngineError::InvalidRunState { .. })
        ));
        assert!(matches!(
            executor.cancel(&run_id).await,
            Err(EngineError::InvalidRunState { .. })
        ));
    }
}
