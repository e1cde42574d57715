use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::config::RawMonitorOptions;
use crate::engine::{EngineError, QueueEngine};
use crate::error::ConfigError;
use crate::evaluator::{AlertAction, StateTransition, ThresholdEvaluator};
use crate::notify::NotificationTransport;
use crate::state::{KeyValueBackend, StateStore};
use crate::validator::MonitorConfig;

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("an invalid argument was passed to the monitor: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to list queues: {0}")]
    ListQueues(#[source] EngineError),
}

pub type RunResult<T> = Result<T, RunError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    QueueSize,
    LoadState,
    PersistState,
    Dispatch,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureStage::QueueSize => "queue_size",
            FailureStage::LoadState => "load_state",
            FailureStage::PersistState => "persist_state",
            FailureStage::Dispatch => "dispatch",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueFailure {
    pub queue: String,
    pub stage: FailureStage,
    pub message: String,
}

/// Outcome of one pass. Per-queue problems end up in `failures`; the pass
/// itself only fails when the queue list cannot be obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub identity: String,
    pub started_at: Option<DateTime<Utc>>,
    /// Queues reported by the engine.
    pub discovered: usize,
    /// Queues kept by the include and exclude patterns.
    pub matched: usize,
    pub evaluated: usize,
    pub raised: usize,
    pub reraised: usize,
    /// Streaks ended, whether or not a recovery notification went out.
    pub cleared: usize,
    pub notified: usize,
    pub failures: Vec<QueueFailure>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueOutcome {
    action: AlertAction,
    cleared: bool,
    notified: bool,
}

type QueueResult = Result<QueueOutcome, QueueFailure>;

/// Runs evaluation passes against a job engine, a state backend and a
/// notification transport.
pub struct AlertRunner<E: ?Sized, B: ?Sized, T: ?Sized> {
    engine: Arc<E>,
    store: StateStore<B>,
    transport: Arc<T>,
    concurrency: usize,
}

impl<E, B, T> AlertRunner<E, B, T>
where
    E: QueueEngine + ?Sized,
    B: KeyValueBackend + ?Sized,
    T: NotificationTransport + ?Sized,
{
    pub fn new(engine: Arc<E>, store: StateStore<B>, transport: Arc<T>) -> Self {
        Self {
            engine,
            store,
            transport,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Number of queues evaluated at the same time.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &StateStore<B> {
        &self.store
    }

    /// Validates `raw` and runs a pass. Nothing is read or written when the
    /// options are invalid.
    pub async fn run_raw(&self, raw: &RawMonitorOptions, now: DateTime<Utc>) -> RunResult<RunReport> {
        let config = raw.validate()?;
        self.run(&config, now).await
    }

    pub async fn run(&self, config: &MonitorConfig, now: DateTime<Utc>) -> RunResult<RunReport> {
        let discovered: BTreeSet<String> = self
            .engine
            .list_queues()
            .await
            .map_err(RunError::ListQueues)?
            .into_iter()
            .collect();
        let matched: Vec<&String> = discovered
            .iter()
            .filter(|queue| config.matches(queue))
            .collect();

        tracing::debug!(
            target: "alerts",
            identity = config.identity(),
            discovered = discovered.len(),
            matched = matched.len(),
            "starting evaluation pass"
        );

        let evaluator = ThresholdEvaluator::from_config(config);
        let outcomes: Vec<QueueResult> = stream::iter(matched.iter().copied())
            .map(|queue| self.process_queue(config, &evaluator, queue, now))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = RunReport {
            identity: config.identity().to_string(),
            started_at: Some(now),
            discovered: discovered.len(),
            matched: matched.len(),
            ..RunReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.evaluated += 1;
                    match outcome.action {
                        AlertAction::RaiseAlert => report.raised += 1,
                        AlertAction::ReraiseAlert => report.reraised += 1,
                        AlertAction::ClearAlert | AlertAction::NoAction => {}
                    }
                    if outcome.cleared {
                        report.cleared += 1;
                    }
                    if outcome.notified {
                        report.notified += 1;
                    }
                }
                Err(failure) => {
                    if failure.stage == FailureStage::Dispatch {
                        report.evaluated += 1;
                    }
                    report.failures.push(failure);
                }
            }
        }
        report.failures.sort_by(|a, b| a.queue.cmp(&b.queue));

        tracing::info!(
            target: "alerts",
            identity = config.identity(),
            evaluated = report.evaluated,
            raised = report.raised,
            reraised = report.reraised,
            cleared = report.cleared,
            failures = report.failures.len(),
            "evaluation pass finished"
        );
        Ok(report)
    }

    async fn process_queue(
        &self,
        config: &MonitorConfig,
        evaluator: &ThresholdEvaluator,
        queue: &str,
        now: DateTime<Utc>,
    ) -> QueueResult {
        let fail = |stage: FailureStage, message: String| {
            tracing::error!(target: "alerts", queue, %stage, error = %message, "queue evaluation failed");
            QueueFailure {
                queue: queue.to_string(),
                stage,
                message,
            }
        };

        let key = self.store.key(config.identity(), queue);
        let prior = self
            .store
            .load(&key, now)
            .await
            .map_err(|err| fail(FailureStage::LoadState, err.to_string()))?;
        let size = self
            .engine
            .queue_size(queue)
            .await
            .map_err(|err| fail(FailureStage::QueueSize, err.to_string()))?;

        let evaluation = evaluator.evaluate(queue, size, &prior, now);
        let persisted = match evaluation.transition {
            StateTransition::Unchanged => Ok(()),
            StateTransition::Save(next) => self.store.save(&key, &next).await,
            StateTransition::Delete => self.store.delete(&key).await,
        };
        persisted.map_err(|err| fail(FailureStage::PersistState, err.to_string()))?;

        let cleared = evaluation.transition == StateTransition::Delete;
        let Some(template_id) = evaluation.action.template_id() else {
            if cleared {
                tracing::info!(target: "alerts", queue, size, "alert cleared without notification");
            }
            return Ok(QueueOutcome {
                action: evaluation.action,
                cleared,
                notified: false,
            });
        };

        tracing::debug!(
            target: "alerts",
            queue,
            size,
            action = %evaluation.action,
            sending_number = evaluation.context.sending_number,
            "dispatching notification"
        );
        self.transport
            .send(template_id, &evaluation.context.to_context())
            .await
            .map_err(|err| fail(FailureStage::Dispatch, err.to_string()))?;

        Ok(QueueOutcome {
            action: evaluation.action,
            cleared,
            notified: true,
        })
    }
}
