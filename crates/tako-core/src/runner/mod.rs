//! The workflow runner: input validation, serial step execution, and
//! dispatch to shell, container, and builtin steps.
//!
//! A single [`Runner`] root holds references (via [`EngineShared`]) to the
//! lock manager, template engine, subscription evaluator, discovery
//! orchestrator, resource manager, and container runtime. Child runners are
//! built by the [`crate::child::ChildRunnerFactory`] with the same shared
//! references and their own isolated workspace.

pub mod steps;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tako_types::config::GlobalConfig;
use tako_types::error::InputError;
use tako_types::runid::RunId;
use tako_types::workflow::{StepKind, Workflow, WorkflowStep};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::child::ChildRunnerFactory;
use crate::config::{self, ConfigError};
use crate::fanout::executor::{FanOutExecutor, FanOutParams};
use crate::fanout::FanOutError;
use crate::lock::{LockError, LockManager};
use crate::orchestrator::Orchestrator;
use crate::resource::{QuotaError, ResourceManager, ResourceManagerConfig};
use crate::runtime::BoxContainerRuntime;
use crate::state::{
    ExecutionPhase, ExecutionState, ExecutionStateStore, StateError, StepRecord,
};
use crate::subscription::discovery::{CacheDiscoverer, SubscriptionDiscoverer};
use crate::subscription::evaluator::SubscriptionEvaluator;
use crate::template::{TemplateEngine, TemplateError, TemplateScope};

/// The sole builtin step reference.
pub const FANOUT_BUILTIN: &str = "tako/fan-out@v1";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Pre-execution failures of a workflow run. Failures inside a step are
/// recorded in the step record and surface as a failed
/// [`ExecutionResult`], not as an `Err`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("resource limit config error: {0}")]
    Resource(#[from] tako_types::resource::ResourceError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    FanOut(#[from] FanOutError),
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Outcome of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: String,
    pub workflow: String,
    pub phase: ExecutionPhase,
    pub steps: Vec<StepRecord>,
    /// First surfaced error on failure.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// The single success/failure boolean for orchestration callers.
    pub fn succeeded(&self) -> bool {
        self.phase == ExecutionPhase::Completed
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunner port
// ---------------------------------------------------------------------------

/// Capability contract for executing a named workflow in a repository.
pub trait WorkflowRunner: Send + Sync {
    fn execute_workflow(
        &self,
        cancel: &CancellationToken,
        workflow_name: &str,
        inputs: BTreeMap<String, Value>,
        repo_path: &Path,
    ) -> impl Future<Output = Result<ExecutionResult, RunnerError>> + Send;
}

/// Object-safe twin of [`WorkflowRunner`] with boxed futures. The boxing
/// also breaks the otherwise-infinite future type of recursive fan-out
/// (a child workflow may itself fan out).
pub trait WorkflowRunnerDyn: Send + Sync {
    fn execute_workflow_boxed<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        workflow_name: &'a str,
        inputs: BTreeMap<String, Value>,
        repo_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult, RunnerError>> + Send + 'a>>;
}

impl<T: WorkflowRunner> WorkflowRunnerDyn for T {
    fn execute_workflow_boxed<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        workflow_name: &'a str,
        inputs: BTreeMap<String, Value>,
        repo_path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult, RunnerError>> + Send + 'a>> {
        Box::pin(self.execute_workflow(cancel, workflow_name, inputs, repo_path))
    }
}

/// Type-erased workflow runner.
pub struct BoxWorkflowRunner(Box<dyn WorkflowRunnerDyn>);

impl BoxWorkflowRunner {
    pub fn new(runner: impl WorkflowRunner + 'static) -> Self {
        Self(Box::new(runner))
    }

    pub async fn execute_workflow(
        &self,
        cancel: &CancellationToken,
        workflow_name: &str,
        inputs: BTreeMap<String, Value>,
        repo_path: &Path,
    ) -> Result<ExecutionResult, RunnerError> {
        self.0
            .execute_workflow_boxed(cancel, workflow_name, inputs, repo_path)
            .await
    }
}

// ---------------------------------------------------------------------------
// EngineShared
// ---------------------------------------------------------------------------

/// References shared by the root runner and every child runner.
pub struct EngineShared<D: SubscriptionDiscoverer> {
    pub lock_manager: Arc<LockManager>,
    pub templates: Arc<TemplateEngine>,
    pub evaluator: Arc<SubscriptionEvaluator>,
    pub orchestrator: Orchestrator<D>,
    pub resources: Arc<ResourceManager>,
    pub container_runtime: Option<BoxContainerRuntime>,
    pub cache_dir: PathBuf,
    pub settings: GlobalConfig,
}

impl<D: SubscriptionDiscoverer> std::fmt::Debug for EngineShared<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl EngineShared<CacheDiscoverer> {
    /// Wire up the full engine against a workspace and repository cache.
    pub fn bootstrap(
        workspace: &Path,
        cache_dir: PathBuf,
        settings: GlobalConfig,
        container_runtime: Option<BoxContainerRuntime>,
    ) -> Result<Arc<Self>, RunnerError> {
        let templates = Arc::new(TemplateEngine::new(settings.template_cache_bytes));
        let evaluator = Arc::new(SubscriptionEvaluator::new(
            settings.filter_cache_entries,
            Arc::clone(&templates),
        ));
        let lock_manager = Arc::new(LockManager::new(
            workspace,
            std::time::Duration::from_secs(settings.lock_ttl_secs),
        )?);
        let orchestrator = Orchestrator::new(
            CacheDiscoverer::new(cache_dir.clone()),
            settings.drop_disabled_subscriptions,
            settings.prioritize_matches,
        );
        let resources = Arc::new(ResourceManager::new(ResourceManagerConfig {
            monitoring_interval: std::time::Duration::from_secs(
                settings.monitoring_interval_secs,
            ),
            warning_threshold: settings.warning_threshold,
            history_limit: settings.usage_history_limit,
        }));
        resources.apply_quota_overrides(&settings.repo_limits, &settings.step_limits)?;
        Ok(Arc::new(Self {
            lock_manager,
            templates,
            evaluator,
            orchestrator,
            resources,
            container_runtime,
            cache_dir,
            settings,
        }))
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes workflows in one workspace under one run identity.
pub struct Runner<D: SubscriptionDiscoverer + 'static> {
    shared: Arc<EngineShared<D>>,
    workspace: PathBuf,
    run_id: String,
    dry_run: bool,
}

impl<D: SubscriptionDiscoverer + 'static> Runner<D> {
    /// Root runner for a fresh top-level invocation.
    pub fn root(
        shared: Arc<EngineShared<D>>,
        workspace: PathBuf,
        dry_run: bool,
    ) -> Self {
        Self {
            shared,
            workspace,
            run_id: RunId::generate().as_str().to_string(),
            dry_run,
        }
    }

    /// Runner bound to an existing (scoped) run identity; used by the child
    /// factory.
    pub(crate) fn scoped(
        shared: Arc<EngineShared<D>>,
        workspace: PathBuf,
        run_id: String,
        dry_run: bool,
    ) -> Self {
        Self {
            shared,
            workspace,
            run_id,
            dry_run,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn shared(&self) -> &Arc<EngineShared<D>> {
        &self.shared
    }

    async fn execute_inner(
        &self,
        cancel: &CancellationToken,
        workflow_name: &str,
        inputs: BTreeMap<String, Value>,
        repo_path: &Path,
    ) -> Result<ExecutionResult, RunnerError> {
        let repo_config = config::load_repo_config(repo_path)?;
        let workflow = repo_config
            .workflows
            .get(workflow_name)
            .ok_or_else(|| RunnerError::NotFound(workflow_name.to_string()))?;

        let resolved = resolve_inputs(workflow, inputs)?;

        let store = ExecutionStateStore::new(&self.workspace)?;
        let mut state = ExecutionState::new(
            self.run_id.as_str(),
            workflow_name,
            repo_path.display().to_string(),
            resolved.clone(),
        );
        state.phase = ExecutionPhase::Running;
        store.save(&state)?;

        tracing::info!(
            run_id = self.run_id.as_str(),
            workflow = workflow_name,
            repo = %repo_path.display(),
            dry_run = self.dry_run,
            "starting workflow"
        );

        let input_map: Map<String, Value> = resolved
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut scope = TemplateScope::new(input_map);
        let source_repo = source_repo_from_path(repo_path);

        for step in &workflow.steps {
            if cancel.is_cancelled() {
                state.finish(ExecutionPhase::Failed, Some("run canceled".to_string()));
                store.save(&state)?;
                return Ok(self.result_from(workflow_name, state));
            }

            let started_at = Utc::now();
            let outcome = self
                .run_step(cancel, step, &scope, &source_repo, repo_path, &resolved)
                .await;

            let record = StepRecord {
                id: step.id.clone(),
                started_at,
                completed_at: Some(Utc::now()),
                success: outcome.success,
                stdout: outcome.stdout.clone(),
                outputs: outcome.outputs.clone(),
                error: outcome.error.clone(),
            };
            state.record_step(record);
            store.save(&state)?;

            if outcome.success {
                scope.add_step_outputs(&step.id, &outcome.outputs);
            } else {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "step failed".to_string());
                tracing::warn!(
                    run_id = self.run_id.as_str(),
                    step = step.id.as_str(),
                    reason = reason.as_str(),
                    "step failed, terminating workflow"
                );
                state.finish(
                    ExecutionPhase::Failed,
                    Some(format!("step '{}' failed: {reason}", step.id)),
                );
                store.save(&state)?;
                return Ok(self.result_from(workflow_name, state));
            }
        }

        state.finish(ExecutionPhase::Completed, None);
        store.save(&state)?;
        tracing::info!(
            run_id = self.run_id.as_str(),
            workflow = workflow_name,
            steps = state.steps.len(),
            "workflow completed"
        );
        Ok(self.result_from(workflow_name, state))
    }

    /// Dispatch one step to its execution mode.
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        step: &WorkflowStep,
        scope: &TemplateScope,
        source_repo: &str,
        repo_path: &Path,
        inputs: &BTreeMap<String, Value>,
    ) -> steps::StepOutcome {
        if self.dry_run {
            return steps::dry_run_outcome(step);
        }
        match step.kind() {
            StepKind::Builtin => {
                self.run_builtin(cancel, step, scope, source_repo).await
            }
            StepKind::Container => {
                steps::run_container_step(
                    cancel,
                    self.shared.container_runtime.as_ref(),
                    &self.shared.resources,
                    &self.shared.templates,
                    step,
                    scope,
                    source_repo,
                    repo_path,
                    &self.run_id,
                    &self.workspace,
                    inputs,
                )
                .await
            }
            StepKind::Shell => {
                steps::run_shell_step(
                    cancel,
                    &self.shared.templates,
                    step,
                    scope,
                    repo_path,
                    &self.run_id,
                    &self.workspace,
                    inputs,
                )
                .await
            }
        }
    }

    /// The fan-out builtin: discover subscribers, launch children, await.
    async fn run_builtin(
        &self,
        cancel: &CancellationToken,
        step: &WorkflowStep,
        scope: &TemplateScope,
        source_repo: &str,
    ) -> steps::StepOutcome {
        let uses = step.uses.as_deref().unwrap_or_default();
        if uses != FANOUT_BUILTIN {
            return steps::StepOutcome::failure(format!("unknown builtin '{uses}'"));
        }

        let expanded = match expand_with_values(&self.shared.templates, &step.with, scope) {
            Ok(expanded) => expanded,
            Err(err) => return steps::StepOutcome::failure(err.to_string()),
        };
        let params = match FanOutParams::from_with(&expanded) {
            Ok(params) => params,
            Err(err) => return steps::StepOutcome::failure(err.to_string()),
        };

        let factory = Arc::new(ChildRunnerFactory::new(
            Arc::clone(&self.shared),
            self.workspace.clone(),
            self.dry_run,
        ));
        let executor = FanOutExecutor::new(
            Arc::clone(&self.shared),
            Arc::clone(&factory),
            self.workspace.join("fanout-states"),
        );
        let fanout_id = format!("{}-{}", self.run_id, step.id);

        let outcome = executor
            .execute(cancel, &self.run_id, source_repo, &fanout_id, params)
            .await;
        factory.close();

        match outcome {
            Ok(outcome) => {
                let summary = format!(
                    "fan-out triggered {} of {} subscribers",
                    outcome.triggered, outcome.subscribers
                );
                let mut outputs = BTreeMap::new();
                outputs.insert("triggered".to_string(), outcome.triggered.to_string());
                outputs.insert(
                    "subscribers".to_string(),
                    outcome.subscribers.to_string(),
                );
                steps::StepOutcome {
                    success: outcome.status == tako_types::fanout::FanOutStatus::Completed,
                    stdout: summary,
                    outputs,
                    error: outcome.first_error,
                }
            }
            Err(err) => steps::StepOutcome::failure(err.to_string()),
        }
    }

    fn result_from(&self, workflow: &str, state: ExecutionState) -> ExecutionResult {
        ExecutionResult {
            run_id: self.run_id.clone(),
            workflow: workflow.to_string(),
            phase: state.phase,
            steps: state.steps,
            error: state.error,
        }
    }
}

impl<D: SubscriptionDiscoverer + 'static> WorkflowRunner for Runner<D> {
    async fn execute_workflow(
        &self,
        cancel: &CancellationToken,
        workflow_name: &str,
        inputs: BTreeMap<String, Value>,
        repo_path: &Path,
    ) -> Result<ExecutionResult, RunnerError> {
        self.execute_inner(cancel, workflow_name, inputs, repo_path).await
    }
}

// ---------------------------------------------------------------------------
// Input resolution
// ---------------------------------------------------------------------------

/// Validate provided inputs against the workflow's declarations: required
/// inputs must be present, defaults fill absences, enum constraints are
/// exact case-sensitive matches. No other type coercion happens here.
pub fn resolve_inputs(
    workflow: &Workflow,
    mut provided: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, InputError> {
    for (name, spec) in &workflow.inputs {
        if !provided.contains_key(name) {
            if spec.required {
                return Err(InputError::MissingRequired(name.clone()));
            }
            if let Some(default) = &spec.default {
                provided.insert(name.clone(), default.clone());
            }
        }

        if let (Some(value), Some(validation)) = (provided.get(name), &spec.validation) {
            if let Some(allowed) = &validation.enum_values {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !allowed.iter().any(|candidate| candidate == &text) {
                    return Err(InputError::EnumMismatch {
                        name: name.clone(),
                        allowed: allowed.clone(),
                        value: text,
                    });
                }
            }
        }
    }
    Ok(provided)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Template-expand every string inside a `with` block (recursing through
/// arrays and objects) so builtin parameters can reference inputs and
/// prior step outputs.
fn expand_with_values(
    templates: &TemplateEngine,
    with: &BTreeMap<String, Value>,
    scope: &TemplateScope,
) -> Result<BTreeMap<String, Value>, TemplateError> {
    let ctx = scope.to_value();
    let mut expanded = BTreeMap::new();
    for (key, value) in with {
        expanded.insert(key.clone(), expand_value(templates, value, &ctx)?);
    }
    Ok(expanded)
}

fn expand_value(
    templates: &TemplateEngine,
    value: &Value,
    ctx: &Value,
) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(text) if text.contains("{{") => {
            Value::String(templates.expand(text, ctx)?)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| expand_value(templates, item, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), expand_value(templates, v, ctx)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Derive the `owner/repo` name from a cache-layout checkout path
/// (`<cache>/repos/<owner>/<repo>/<branch>`); outside that layout the
/// directory name stands in.
pub fn source_repo_from_path(repo_path: &Path) -> String {
    let components: Vec<String> = repo_path
        .components()
        .filter_map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect();
    if components.len() >= 4 && components[components.len() - 4] == "repos" {
        return format!(
            "{}/{}",
            components[components.len() - 3],
            components[components.len() - 2]
        );
    }
    components.last().cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tako_types::workflow::{InputSpec, InputValidation};

    fn workflow_with_inputs(entries: Vec<(&str, InputSpec)>) -> Workflow {
        Workflow {
            inputs: entries
                .into_iter()
                .map(|(name, spec)| (name.to_string(), spec))
                .collect(),
            steps: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    #[test]
    fn missing_required_input_is_error() {
        let workflow = workflow_with_inputs(vec![(
            "environment",
            InputSpec {
                required: true,
                ..InputSpec::default()
            },
        )]);
        let err = resolve_inputs(&workflow, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, InputError::MissingRequired(_)));
    }

    #[test]
    fn default_applies_when_absent() {
        let workflow = workflow_with_inputs(vec![(
            "tag",
            InputSpec {
                default: Some(Value::String("latest".into())),
                ..InputSpec::default()
            },
        )]);
        let resolved = resolve_inputs(&workflow, BTreeMap::new()).unwrap();
        assert_eq!(resolved["tag"], Value::String("latest".into()));
    }

    #[test]
    fn provided_value_beats_default() {
        let workflow = workflow_with_inputs(vec![(
            "tag",
            InputSpec {
                default: Some(Value::String("latest".into())),
                ..InputSpec::default()
            },
        )]);
        let provided =
            BTreeMap::from([("tag".to_string(), Value::String("v2".into()))]);
        let resolved = resolve_inputs(&workflow, provided).unwrap();
        assert_eq!(resolved["tag"], Value::String("v2".into()));
    }

    #[test]
    fn enum_constraint_is_case_sensitive() {
        let workflow = workflow_with_inputs(vec![(
            "environment",
            InputSpec {
                required: true,
                validation: Some(InputValidation {
                    enum_values: Some(vec!["dev".to_string(), "prod".to_string()]),
                }),
                ..InputSpec::default()
            },
        )]);

        let ok = BTreeMap::from([(
            "environment".to_string(),
            Value::String("prod".into()),
        )]);
        assert!(resolve_inputs(&workflow, ok).is_ok());

        let wrong_case = BTreeMap::from([(
            "environment".to_string(),
            Value::String("Prod".into()),
        )]);
        let err = resolve_inputs(&workflow, wrong_case).unwrap_err();
        assert!(matches!(err, InputError::EnumMismatch { .. }));
    }

    #[test]
    fn enum_applies_to_defaulted_value() {
        let workflow = workflow_with_inputs(vec![(
            "environment",
            InputSpec {
                default: Some(Value::String("qa".into())),
                validation: Some(InputValidation {
                    enum_values: Some(vec!["dev".to_string(), "prod".to_string()]),
                }),
                ..InputSpec::default()
            },
        )]);
        let err = resolve_inputs(&workflow, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, InputError::EnumMismatch { .. }));
    }

    #[test]
    fn undeclared_inputs_pass_through() {
        let workflow = workflow_with_inputs(vec![]);
        let provided =
            BTreeMap::from([("extra".to_string(), Value::String("kept".into()))]);
        let resolved = resolve_inputs(&workflow, provided).unwrap();
        assert_eq!(resolved["extra"], Value::String("kept".into()));
    }

    #[test]
    fn source_repo_derivation() {
        assert_eq!(
            source_repo_from_path(Path::new("/cache/repos/ex/lib/main")),
            "ex/lib"
        );
        assert_eq!(
            source_repo_from_path(Path::new("/somewhere/else/checkout")),
            "checkout"
        );
    }

    // -----------------------------------------------------------------------
    // End-to-end execution
    // -----------------------------------------------------------------------

    mod execution {
        use super::*;
        use tako_types::config::{GlobalConfig, QuotaOverride};
        use tako_types::runid::RunId;
        use tempfile::TempDir;

        struct Fixture {
            workspace: TempDir,
            repo: TempDir,
            shared: Arc<EngineShared<CacheDiscoverer>>,
        }

        impl Fixture {
            fn new(tako_yml: &str) -> Self {
                let workspace = TempDir::new().unwrap();
                let cache = TempDir::new().unwrap();
                let repo = TempDir::new().unwrap();
                std::fs::write(repo.path().join("tako.yml"), tako_yml).unwrap();
                let shared = EngineShared::bootstrap(
                    workspace.path(),
                    cache.path().to_path_buf(),
                    tako_types::config::GlobalConfig::default(),
                    None,
                )
                .unwrap();
                Self {
                    workspace,
                    repo,
                    shared,
                }
            }

            async fn execute(
                &self,
                workflow: &str,
                inputs: BTreeMap<String, Value>,
                dry_run: bool,
            ) -> Result<ExecutionResult, RunnerError> {
                let runner = Runner::root(
                    Arc::clone(&self.shared),
                    self.workspace.path().to_path_buf(),
                    dry_run,
                );
                runner
                    .execute_workflow(
                        &CancellationToken::new(),
                        workflow,
                        inputs,
                        self.repo.path(),
                    )
                    .await
            }
        }

        const CHAINED_STEPS: &str = r#"
version: "1"
workflows:
  build:
    inputs:
      tag:
        type: string
        default: latest
    steps:
      - id: first
        run: echo "artifact=tako-{{ inputs.tag }}.tar.gz"
        produces:
          outputs:
            artifact: "artifact=(\\S+)"
      - id: second
        run: echo "got {{ steps.first.artifact }}"
        produces:
          outputs:
            received: from_stdout
"#;

        #[tokio::test]
        async fn happy_path_chains_step_outputs() {
            let fixture = Fixture::new(CHAINED_STEPS);
            let result = fixture
                .execute("build", BTreeMap::new(), false)
                .await
                .unwrap();

            assert!(result.succeeded(), "{:?}", result.error);
            assert!(RunId::is_valid(&result.run_id));
            assert_eq!(result.steps.len(), 2);
            assert_eq!(result.steps[0].outputs["artifact"], "tako-latest.tar.gz");
            assert_eq!(result.steps[1].outputs["received"], "got tako-latest.tar.gz");

            // Durable state matches the returned result.
            let store = ExecutionStateStore::new(fixture.workspace.path()).unwrap();
            let state = store.load(&result.run_id).unwrap();
            assert_eq!(state.phase, ExecutionPhase::Completed);
            assert_eq!(state.steps.len(), 2);
            assert_eq!(state.workflow, "build");
        }

        #[tokio::test]
        async fn provided_input_overrides_default() {
            let fixture = Fixture::new(CHAINED_STEPS);
            let inputs =
                BTreeMap::from([("tag".to_string(), Value::String("v2".into()))]);
            let result = fixture.execute("build", inputs, false).await.unwrap();
            assert_eq!(result.steps[0].outputs["artifact"], "tako-v2.tar.gz");
        }

        #[tokio::test]
        async fn missing_config_is_config_error() {
            let fixture = Fixture::new(CHAINED_STEPS);
            std::fs::remove_file(fixture.repo.path().join("tako.yml")).unwrap();
            let err = fixture
                .execute("build", BTreeMap::new(), false)
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::Config(ConfigError::Missing(_))));
        }

        #[tokio::test]
        async fn unknown_workflow_is_not_found() {
            let fixture = Fixture::new(CHAINED_STEPS);
            let err = fixture
                .execute("deploy", BTreeMap::new(), false)
                .await
                .unwrap_err();
            assert!(matches!(err, RunnerError::NotFound(name) if name == "deploy"));
        }

        #[tokio::test]
        async fn failing_step_terminates_the_workflow() {
            let fixture = Fixture::new(
                r#"
version: "1"
workflows:
  build:
    steps:
      - id: boom
        run: exit 4
      - id: never
        run: echo unreachable
"#,
            );
            let result = fixture
                .execute("build", BTreeMap::new(), false)
                .await
                .unwrap();
            assert!(!result.succeeded());
            assert_eq!(result.steps.len(), 1);
            assert!(!result.steps[0].success);
            let error = result.error.unwrap();
            assert!(error.contains("step 'boom' failed"), "{error}");
        }

        #[tokio::test]
        async fn dry_run_reports_without_executing() {
            let fixture = Fixture::new(
                r#"
version: "1"
workflows:
  build:
    steps:
      - id: touch
        run: touch side-effect.txt
"#,
            );
            let result = fixture
                .execute("build", BTreeMap::new(), true)
                .await
                .unwrap();
            assert!(result.succeeded());
            assert_eq!(result.steps[0].stdout, "[dry-run] touch side-effect.txt");
            assert!(!fixture.repo.path().join("side-effect.txt").exists());
        }

        #[tokio::test]
        async fn bootstrap_applies_configured_quota_tables() {
            let workspace = TempDir::new().unwrap();
            let cache = TempDir::new().unwrap();

            let mut settings = GlobalConfig::default();
            settings.repo_limits.insert(
                "ex/lib".to_string(),
                QuotaOverride {
                    cpu: Some("4".to_string()),
                    memory: None,
                },
            );
            settings
                .step_limits
                .entry("ex/lib".to_string())
                .or_default()
                .insert(
                    "publish".to_string(),
                    QuotaOverride {
                        cpu: Some("500m".to_string()),
                        memory: None,
                    },
                );

            let shared = EngineShared::bootstrap(
                workspace.path(),
                cache.path().to_path_buf(),
                settings,
                None,
            )
            .unwrap();

            // The configured repository ceiling gates requests.
            assert!(shared
                .resources
                .validate_resource_request("ex/lib", "build", 5.0, 100.0)
                .is_err());
            assert!(shared
                .resources
                .validate_resource_request("ex/lib", "build", 3.0, 100.0)
                .is_ok());
            // The configured step ceiling is tighter still.
            assert!(shared
                .resources
                .validate_resource_request("ex/lib", "publish", 1.0, 100.0)
                .is_err());
        }

        #[tokio::test]
        async fn bootstrap_rejects_malformed_quota_table() {
            let workspace = TempDir::new().unwrap();
            let cache = TempDir::new().unwrap();

            let mut settings = GlobalConfig::default();
            settings.repo_limits.insert(
                "ex/lib".to_string(),
                QuotaOverride {
                    cpu: Some("fast".to_string()),
                    memory: None,
                },
            );

            let err = EngineShared::bootstrap(
                workspace.path(),
                cache.path().to_path_buf(),
                settings,
                None,
            )
            .unwrap_err();
            assert!(matches!(err, RunnerError::Resource(_)));
        }

        #[tokio::test]
        async fn pre_canceled_run_returns_partial_result() {
            let fixture = Fixture::new(CHAINED_STEPS);
            let runner = Runner::root(
                Arc::clone(&fixture.shared),
                fixture.workspace.path().to_path_buf(),
                false,
            );
            let cancel = CancellationToken::new();
            cancel.cancel();
            let result = runner
                .execute_workflow(&cancel, "build", BTreeMap::new(), fixture.repo.path())
                .await
                .unwrap();
            assert!(!result.succeeded());
            assert!(result.steps.is_empty());
            assert_eq!(result.error.as_deref(), Some("run canceled"));
        }
    }
}
