// ABOUTME: Concurrent dispatch of one batch of nodes with retry and timeout
// ABOUTME: Optional semaphore bound, per-attempt timeout, cooperative cancellation

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::error::NodeExecutionError;
use super::state::{AttemptOutcome, AttemptRecord};
use super::worker::{NodeOutput, NodeRequest, NodeWorker};
use crate::graph::RetryPolicy;

pub struct WaveScheduler {
    semaphore: Option<Arc<Semaphore>>,
    max_concurrency: Option<NonZeroUsize>,
}

/// One node handed to the scheduler
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub request: NodeRequest,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

/// Everything that happened to one node during a dispatch
#[derive(Debug, Clone)]
pub struct NodeRunReport {
    pub node_id: String,
    pub attempts: Vec<AttemptRecord>,
    /// Output of the successful attempt, or of the last failed one
    pub output: Option<NodeOutput>,
    pub error: Option<NodeExecutionError>,
    /// Retries were abandoned because the run was cancelled
    pub cancelled: bool,
}

impl NodeRunReport {
    pub fn succeeded(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|a| a.outcome == AttemptOutcome::Succeeded)
    }

    fn not_started(node_id: String, error: NodeExecutionError) -> Self {
        Self {
            node_id,
            attempts: Vec::new(),
            output: None,
            error: Some(error),
            cancelled: false,
        }
    }
}

impl WaveScheduler {
    /// `None` leaves concurrency unbounded
    pub fn new(max_concurrency: Option<NonZeroUsize>) -> Self {
        Self {
            semaphore: max_concurrency.map(|n| Arc::new(Semaphore::new(n.get()))),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency.map(NonZeroUsize::get)
    }

    /// Run a batch concurrently. Reports come back in completion order.
    pub async fn execute_batch(
        &self,
        tasks: Vec<DispatchTask>,
        worker: &Arc<dyn NodeWorker>,
        cancelled: &Arc<AtomicBool>,
    ) -> Vec<NodeRunReport> {
        if tasks.is_empty() {
            return Vec::new();
        }

        info!("Executing batch of {} nodes", tasks.len());

        let mut running: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| {
                let node_id = task.request.node_id.clone();
                let worker = Arc::clone(worker);
                let cancelled = Arc::clone(cancelled);
                let semaphore = self.semaphore.clone();

                let handle = tokio::spawn(async move {
                    let _permit = match semaphore {
                        Some(semaphore) => match semaphore.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(e) => {
                                return NodeRunReport::not_started(
                                    task.request.node_id.clone(),
                                    NodeExecutionError::Failed {
                                        node_id: task.request.node_id.clone(),
                                        message: format!("scheduler closed: {}", e),
                                    },
                                )
                            }
                        },
                        None => None,
                    };

                    execute_with_retry(task, worker, cancelled).await
                });

                async move {
                    match handle.await {
                        Ok(report) => report,
                        Err(join_error) => {
                            error!("Node {} join error: {}", node_id, join_error);
                            NodeRunReport::not_started(
                                node_id.clone(),
                                NodeExecutionError::Panicked {
                                    node_id,
                                    message: join_error.to_string(),
                                },
                            )
                        }
                    }
                }
            })
            .collect();

        let mut reports = Vec::new();
        while let Some(report) = running.next().await {
            debug!(
                "Node {} finished after {} attempt(s)",
                report.node_id,
                report.attempts.len()
            );
            reports.push(report);
        }

        info!("Batch completed. {} reports", reports.len());
        reports
    }
}

impl Default for WaveScheduler {
    fn default() -> Self {
        Self::new(None)
    }
}

async fn execute_with_retry(
    task: DispatchTask,
    worker: Arc<dyn NodeWorker>,
    cancelled: Arc<AtomicBool>,
) -> NodeRunReport {
    let node_id = task.request.node_id.clone();
    let max_attempts = task.retry.max_attempts.max(1);

    let mut attempts = Vec::new();
    let mut last_output = None;
    let mut last_error = None;
    let mut abandoned = false;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            if cancelled.load(Ordering::SeqCst) {
                abandoned = true;
                break;
            }

            let delay = task.retry.calculate_delay(attempt - 2);
            debug!("Retrying node {} in {:?}", node_id, delay);
            sleep(delay).await;

            if cancelled.load(Ordering::SeqCst) {
                abandoned = true;
                break;
            }
        }

        info!(
            "Executing node {} (attempt {}/{})",
            node_id, attempt, max_attempts
        );

        let mut request = task.request.clone();
        request.attempt = attempt;

        let started_at = Utc::now();
        let result = timeout(task.timeout, worker.execute_node(request)).await;
        let finished_at = Utc::now();

        let (outcome, error) = match result {
            Ok(output) if output.success => {
                attempts.push(AttemptRecord {
                    attempt,
                    started_at,
                    finished_at,
                    outcome: AttemptOutcome::Succeeded,
                    error: None,
                });
                return NodeRunReport {
                    node_id,
                    attempts,
                    output: Some(output),
                    error: None,
                    cancelled: false,
                };
            }
            Ok(output) => {
                let error = NodeExecutionError::Failed {
                    node_id: node_id.clone(),
                    message: output
                        .error
                        .clone()
                        .unwrap_or_else(|| "worker reported failure".to_string()),
                };
                last_output = Some(output);
                (AttemptOutcome::Failed, error)
            }
            Err(_) => (
                AttemptOutcome::TimedOut,
                NodeExecutionError::Timeout {
                    node_id: node_id.clone(),
                    timeout: task.timeout,
                },
            ),
        };

        warn!("{}", error);
        attempts.push(AttemptRecord {
            attempt,
            started_at,
            finished_at,
            outcome,
            error: Some(error.to_string()),
        });
        last_error = Some(error);
    }

    if abandoned {
        info!("Run cancelled; no further retries for node {}", node_id);
    }

    NodeRunReport {
        node_id,
        attempts,
        output: last_output,
        error: last_error,
        cancelled: abandoned,
    }
}
