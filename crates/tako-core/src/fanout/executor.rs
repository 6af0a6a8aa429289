//! The fan-out executor: discover subscribers for an event, launch child
//! workflows under concurrency bounds, and converge to one terminal state.
//!
//! Lifecycle per execution: discover -> evaluate -> register children ->
//! `running` -> `waiting` -> spawn bounded child tasks -> aggregate. A
//! `(repository, workflow)` pair is triggered at most once per fan-out
//! (first-wins); with `wait_for_children` the fan-out aggregates after all
//! children reach a terminal state, otherwise the first failure cancels
//! the remaining children and fails the fan-out immediately.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tako_types::error::InputError;
use tako_types::event::Event;
use tako_types::fanout::{ChildStatus, FanOutState, FanOutStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::child::ChildRunnerFactory;
use crate::runner::EngineShared;
use crate::subscription::discovery::SubscriptionDiscoverer;

use super::state::{FanOutError, FanOutStateManager};

// ---------------------------------------------------------------------------
// FanOutParams
// ---------------------------------------------------------------------------

/// Parameters of the `tako/fan-out@v1` builtin, parsed from its `with`
/// block.
#[derive(Debug, Clone)]
pub struct FanOutParams {
    pub event_type: String,
    pub schema_version: Option<String>,
    pub payload: Map<String, Value>,
    /// Aggregate after all children finish (default) vs. fail fast.
    pub wait_for_children: bool,
    /// Bound on concurrently running children within this fan-out.
    pub concurrency_limit: Option<usize>,
    /// Overall deadline for the fan-out.
    pub timeout: Option<Duration>,
}

impl FanOutParams {
    /// Parse and validate the builtin's `with` parameters.
    pub fn from_with(with: &BTreeMap<String, Value>) -> Result<Self, InputError> {
        let event_type = match with.get("event_type") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(_) => {
                return Err(InputError::Invalid {
                    name: "event_type".to_string(),
                    reason: "must be a non-empty string".to_string(),
                });
            }
            None => return Err(InputError::Empty("event_type".to_string())),
        };

        let schema_version = match with.get("schema_version") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(InputError::Invalid {
                    name: "schema_version".to_string(),
                    reason: "must be a string".to_string(),
                });
            }
        };

        let payload = match with.get("payload") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(InputError::Invalid {
                    name: "payload".to_string(),
                    reason: "must be a map".to_string(),
                });
            }
        };

        let wait_for_children = match with.get("wait_for_children") {
            None => true,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(s)) => s.parse::<bool>().map_err(|_| InputError::Invalid {
                name: "wait_for_children".to_string(),
                reason: format!("'{s}' is not a boolean"),
            })?,
            Some(_) => {
                return Err(InputError::Invalid {
                    name: "wait_for_children".to_string(),
                    reason: "must be a boolean".to_string(),
                });
            }
        };

        let concurrency_limit = match with.get("concurrency_limit") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let limit = value.as_i64().ok_or_else(|| InputError::Invalid {
                    name: "concurrency_limit".to_string(),
                    reason: "must be an integer".to_string(),
                })?;
                if limit < 1 {
                    return Err(InputError::Invalid {
                        name: "concurrency_limit".to_string(),
                        reason: "must be positive".to_string(),
                    });
                }
                Some(limit as usize)
            }
        };

        let timeout = match with.get("timeout") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_duration(value).map_err(|reason| {
                InputError::Invalid {
                    name: "timeout".to_string(),
                    reason,
                }
            })?),
        };

        Ok(Self {
            event_type,
            schema_version,
            payload,
            wait_for_children,
            concurrency_limit,
            timeout,
        })
    }
}

/// Accepts bare seconds (`300`) or a `s`/`m`/`h`-suffixed string (`"90s"`,
/// `"5m"`).
fn parse_duration(value: &Value) -> Result<Duration, String> {
    if let Some(secs) = value.as_u64() {
        return Ok(Duration::from_secs(secs));
    }
    let text = value
        .as_str()
        .ok_or_else(|| "must be seconds or a duration string".to_string())?
        .trim();
    let (digits, unit) = match text.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("'{text}' is not a duration"))?;
    match unit {
        "s" | "" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        "h" => Ok(Duration::from_secs(amount * 3600)),
        "ms" => Ok(Duration::from_millis(amount)),
        other => Err(format!("unknown duration unit '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// FanOutOutcome
// ---------------------------------------------------------------------------

/// Summary returned to the fan-out step.
#[derive(Debug, Clone)]
pub struct FanOutOutcome {
    pub status: FanOutStatus,
    /// Subscription matches discovered (before evaluator filtering).
    pub subscribers: usize,
    /// `(repository, workflow)` pairs actually triggered.
    pub triggered: usize,
    pub first_error: Option<String>,
    pub state_id: String,
}

// ---------------------------------------------------------------------------
// FanOutExecutor
// ---------------------------------------------------------------------------

struct Launch {
    key: String,
    repository: String,
    workflow: String,
    inputs: BTreeMap<String, Value>,
    repo_path: PathBuf,
}

/// Drives one fan-out execution end to end.
pub struct FanOutExecutor<D: SubscriptionDiscoverer + 'static> {
    shared: Arc<EngineShared<D>>,
    factory: Arc<ChildRunnerFactory<D>>,
    states_dir: PathBuf,
}

impl<D: SubscriptionDiscoverer + 'static> FanOutExecutor<D> {
    pub fn new(
        shared: Arc<EngineShared<D>>,
        factory: Arc<ChildRunnerFactory<D>>,
        states_dir: PathBuf,
    ) -> Self {
        Self {
            shared,
            factory,
            states_dir,
        }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        parent_run_id: &str,
        source_repo: &str,
        fanout_id: &str,
        params: FanOutParams,
    ) -> Result<FanOutOutcome, FanOutError> {
        let artifact = format!("{source_repo}:default");
        let matches = self
            .shared
            .orchestrator
            .discover_subscriptions(cancel, &artifact, &params.event_type)
            .await?;
        let subscribers = matches.len();

        let event = Event::new(
            params.event_type.clone(),
            params.schema_version.clone(),
            params.payload.clone(),
            source_repo,
        );

        let manager = FanOutStateManager::create(
            &self.states_dir,
            FanOutState::new(
                fanout_id,
                parent_run_id,
                source_repo,
                params.event_type.as_str(),
                params.wait_for_children,
                params.timeout.map(|t| t.as_secs()),
            ),
        )
        .await?;

        // Evaluate each match; survivors become children. Two matches
        // resolving to the same (repository, workflow) collapse into one
        // child (diamond dedup).
        let mut launches: Vec<Launch> = Vec::new();
        let mut seen = HashSet::new();
        for candidate in &matches {
            if !self
                .shared
                .evaluator
                .evaluate_subscription(&candidate.subscription, &event)?
            {
                continue;
            }
            let inputs = self
                .shared
                .evaluator
                .compute_inputs(&candidate.subscription, &event)?;
            let key = manager
                .add_child_workflow(
                    &candidate.repository,
                    &candidate.subscription.workflow,
                    inputs.clone(),
                )
                .await?;
            if seen.insert(key.clone()) {
                launches.push(Launch {
                    key,
                    repository: candidate.repository.clone(),
                    workflow: candidate.subscription.workflow.clone(),
                    inputs,
                    repo_path: candidate.repo_path.clone(),
                });
            }
        }

        if launches.is_empty() {
            manager.finish(FanOutStatus::Completed, None).await?;
            tracing::info!(fanout_id, subscribers, "fan-out with no children completed");
            return Ok(FanOutOutcome {
                status: FanOutStatus::Completed,
                subscribers,
                triggered: 0,
                first_error: None,
                state_id: fanout_id.to_string(),
            });
        }

        manager.set_status(FanOutStatus::Running).await?;
        manager.start_waiting().await?;
        tracing::info!(
            fanout_id,
            children = launches.len(),
            wait_for_children = params.wait_for_children,
            "fan-out launching children"
        );

        let child_cancel = cancel.child_token();
        let limiter = params
            .concurrency_limit
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let mut tasks = JoinSet::new();
        for launch in launches {
            let manager = Arc::clone(&manager);
            let factory = Arc::clone(&self.factory);
            let limiter = limiter.clone();
            let token = child_cancel.clone();
            let parent = parent_run_id.to_string();
            let fail_fast = !params.wait_for_children;
            tasks.spawn(async move {
                run_child(manager, factory, limiter, token, &parent, fail_fast, launch)
                    .await;
            });
        }

        let timed_out = if let Some(limit) = params.timeout {
            tokio::time::timeout(limit, async {
                while tasks.join_next().await.is_some() {}
            })
            .await
            .is_err()
        } else {
            while tasks.join_next().await.is_some() {}
            false
        };

        if timed_out {
            child_cancel.cancel();
            manager
                .close_pending_children(ChildStatus::TimedOut, "fan-out timed out")
                .await?;
            while tasks.join_next().await.is_some() {}
        }

        let snapshot = manager.snapshot().await;
        let failures = snapshot.count_children(ChildStatus::Failed)
            + snapshot.count_children(ChildStatus::TimedOut);
        let first_error = snapshot
            .children
            .values()
            .find_map(|child| child.error.clone());

        let status = if timed_out {
            FanOutStatus::TimedOut
        } else if failures > 0 || cancel.is_cancelled() {
            FanOutStatus::Failed
        } else {
            FanOutStatus::Completed
        };
        let error = match status {
            FanOutStatus::Completed => None,
            FanOutStatus::TimedOut => Some("fan-out timed out".to_string()),
            _ => first_error
                .clone()
                .or_else(|| Some("child workflow failed".to_string())),
        };

        manager.finish(status, error.clone()).await?;
        tracing::info!(fanout_id, %status, failures, "fan-out finished");

        Ok(FanOutOutcome {
            status,
            subscribers,
            triggered: snapshot.triggered.len(),
            first_error: error,
            state_id: fanout_id.to_string(),
        })
    }
}

/// One child's lifecycle inside its spawned task. Journal write failures
/// here are logged and non-fatal: the task cannot abort siblings over
/// bookkeeping.
async fn run_child<D: SubscriptionDiscoverer + 'static>(
    manager: Arc<FanOutStateManager>,
    factory: Arc<ChildRunnerFactory<D>>,
    limiter: Option<Arc<Semaphore>>,
    token: CancellationToken,
    parent_run_id: &str,
    fail_fast: bool,
    launch: Launch,
) {
    let mark = |status: ChildStatus, run_id: Option<String>, error: Option<String>| {
        let manager = Arc::clone(&manager);
        let key = launch.key.clone();
        async move {
            if let Err(err) = manager.update_child_status(&key, status, run_id, error).await {
                tracing::warn!(child = key.as_str(), %err, "failed to journal child status");
            }
        }
    };

    // Respect the step's concurrency bound before touching the factory.
    let _slot = match limiter {
        Some(semaphore) => {
            tokio::select! {
                _ = token.cancelled() => {
                    mark(
                        ChildStatus::Failed,
                        None,
                        Some("canceled: fan-out aborted".to_string()),
                    )
                    .await;
                    return;
                }
                permit = semaphore.acquire_owned() => permit.ok(),
            }
        }
        None => None,
    };

    if token.is_cancelled() {
        mark(
            ChildStatus::Failed,
            None,
            Some("canceled: fan-out aborted".to_string()),
        )
        .await;
        return;
    }

    let scoped_run_id = subscriber_run_id(parent_run_id, &launch.repository);

    // Idempotent triggering: first-wins per (repository, workflow).
    match manager
        .mark_workflow_triggered(&launch.repository, &launch.workflow, &scoped_run_id)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            let existing = manager
                .is_workflow_triggered(&launch.repository, &launch.workflow)
                .await;
            tracing::debug!(
                child = launch.key.as_str(),
                reused_run = existing.as_deref().unwrap_or(""),
                "child already triggered, reusing run"
            );
            mark(ChildStatus::Completed, existing, None).await;
            return;
        }
        Err(err) => {
            mark(ChildStatus::Failed, None, Some(err.to_string())).await;
            return;
        }
    }

    let child = match factory.create_child_runner(&scoped_run_id).await {
        Ok(child) => child,
        Err(err) => {
            mark(
                ChildStatus::Failed,
                Some(scoped_run_id.clone()),
                Some(err.to_string()),
            )
            .await;
            if fail_fast {
                token.cancel();
            }
            return;
        }
    };

    if let Err(err) = manager
        .update_child_running(&launch.key, &scoped_run_id)
        .await
    {
        tracing::warn!(child = launch.key.as_str(), %err, "failed to journal child start");
    }

    let result = child
        .runner
        .execute_workflow(&token, &launch.workflow, launch.inputs.clone(), &launch.repo_path)
        .await;

    match result {
        Ok(outcome) if outcome.succeeded() => {
            mark(ChildStatus::Completed, Some(scoped_run_id), None).await;
        }
        Ok(outcome) => {
            let reason = outcome
                .error
                .unwrap_or_else(|| "child workflow failed".to_string());
            mark(ChildStatus::Failed, Some(scoped_run_id), Some(reason)).await;
            if fail_fast {
                token.cancel();
            }
        }
        Err(err) => {
            mark(
                ChildStatus::Failed,
                Some(scoped_run_id),
                Some(err.to_string()),
            )
            .await;
            if fail_fast {
                token.cancel();
            }
        }
    }
}

/// Scoped run id of a subscriber child.
fn subscriber_run_id(parent_run_id: &str, repository: &str) -> String {
    format!(
        "{parent_run_id}-subscriber-{}",
        repository.replace('/', "-")
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
