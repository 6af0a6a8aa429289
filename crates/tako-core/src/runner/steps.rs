//! Shell and container step execution, dry-run reporting, and declared
//! output extraction.
//!
//! Both step kinds share the same environment injection (`TAKO_RUN_ID`,
//! `TAKO_STEP_ID`, `TAKO_WORKSPACE`, `TAKO_INPUT_<NAME>`) and the same
//! output extraction: `from_stdout`, `from_stderr`, or a regex whose first
//! capture group is taken from the first match in stdout.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tako_types::resource::{parse_cpu, parse_memory_mb};
use tako_types::workflow::{StepProduces, WorkflowStep};
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceManager;
use crate::runtime::{
    BoxContainerRuntime, ContainerConfig, IMAGE_PULL_TIMEOUT_SECS,
};
use crate::template::{TemplateEngine, TemplateScope};

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of one step execution attempt.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub stdout: String,
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            outputs: BTreeMap::new(),
            error: Some(reason.into()),
        }
    }
}

/// Dry-run reporting: the step succeeds without executing.
pub fn dry_run_outcome(step: &WorkflowStep) -> StepOutcome {
    let shown = step
        .run
        .as_deref()
        .or(step.image.as_deref())
        .or(step.uses.as_deref())
        .unwrap_or_default();
    StepOutcome {
        success: true,
        stdout: format!("[dry-run] {shown}"),
        outputs: BTreeMap::new(),
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Environment injection
// ---------------------------------------------------------------------------

/// The standard environment for a step process.
pub(crate) fn injected_env(
    run_id: &str,
    step_id: &str,
    workspace: &Path,
    inputs: &BTreeMap<String, Value>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TAKO_RUN_ID".to_string(), run_id.to_string());
    env.insert("TAKO_STEP_ID".to_string(), step_id.to_string());
    env.insert(
        "TAKO_WORKSPACE".to_string(),
        workspace.display().to_string(),
    );
    for (name, value) in inputs {
        env.insert(format!("TAKO_INPUT_{}", env_suffix(name)), env_string(value));
    }
    env
}

fn env_suffix(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Output extraction
// ---------------------------------------------------------------------------

/// Extract declared outputs from a step's captured streams.
pub(crate) fn extract_outputs(
    produces: Option<&StepProduces>,
    stdout: &str,
    stderr: &str,
) -> Result<BTreeMap<String, String>, String> {
    let mut outputs = BTreeMap::new();
    let Some(produces) = produces else {
        return Ok(outputs);
    };
    for (name, source) in &produces.outputs {
        let value = match source.as_str() {
            "from_stdout" => stdout.trim().to_string(),
            "from_stderr" => stderr.trim().to_string(),
            pattern => {
                let regex = Regex::new(pattern)
                    .map_err(|e| format!("output '{name}' has invalid pattern: {e}"))?;
                let captures = regex.captures(stdout).ok_or_else(|| {
                    format!("output '{name}' pattern matched nothing in stdout")
                })?;
                captures
                    .get(1)
                    .ok_or_else(|| {
                        format!("output '{name}' pattern has no capture group")
                    })?
                    .as_str()
                    .to_string()
            }
        };
        outputs.insert(name.clone(), value);
    }
    Ok(outputs)
}

// ---------------------------------------------------------------------------
// Shell steps
// ---------------------------------------------------------------------------

/// Run a shell step: `sh -c <expanded template>` in the step's working
/// directory with the injected environment.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_shell_step(
    cancel: &CancellationToken,
    templates: &TemplateEngine,
    step: &WorkflowStep,
    scope: &TemplateScope,
    repo_path: &Path,
    run_id: &str,
    workspace: &Path,
    inputs: &BTreeMap<String, Value>,
) -> StepOutcome {
    let Some(run) = step.run.as_deref() else {
        return StepOutcome::failure("shell step has no 'run' command");
    };
    let command = match templates.expand_in_scope(run, scope) {
        Ok(command) => command,
        Err(err) => return StepOutcome::failure(err.to_string()),
    };

    let work_dir = match &step.work_dir {
        Some(dir) => repo_path.join(dir),
        None => repo_path.to_path_buf(),
    };
    let env = match step_environment(templates, step, scope, run_id, workspace, inputs) {
        Ok(env) => env,
        Err(err) => return StepOutcome::failure(err),
    };

    let mut process = tokio::process::Command::new("sh");
    process
        .arg("-c")
        .arg(&command)
        .current_dir(&work_dir)
        .envs(&env)
        .kill_on_drop(true);

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return StepOutcome::failure("canceled: step interrupted");
        }
        output = process.output() => output,
    };

    let output = match output {
        Ok(output) => output,
        Err(err) => return StepOutcome::failure(format!("failed to spawn sh: {err}")),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        return StepOutcome {
            success: false,
            stdout,
            outputs: BTreeMap::new(),
            error: Some(format!(
                "command exited with code {code}: {}",
                stderr.trim()
            )),
        };
    }

    match extract_outputs(step.produces.as_ref(), &stdout, &stderr) {
        Ok(outputs) => StepOutcome {
            success: true,
            stdout,
            outputs,
            error: None,
        },
        Err(reason) => StepOutcome {
            success: false,
            stdout,
            outputs: BTreeMap::new(),
            error: Some(reason),
        },
    }
}

// ---------------------------------------------------------------------------
// Container steps
// ---------------------------------------------------------------------------

/// Run a container step through the runtime port. The image pull is best
/// effort: a pull failure is a warning, and only the run itself fails the
/// step.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_container_step(
    cancel: &CancellationToken,
    runtime: Option<&BoxContainerRuntime>,
    resources: &ResourceManager,
    templates: &TemplateEngine,
    step: &WorkflowStep,
    scope: &TemplateScope,
    source_repo: &str,
    repo_path: &Path,
    run_id: &str,
    workspace: &Path,
    inputs: &BTreeMap<String, Value>,
) -> StepOutcome {
    let Some(runtime) = runtime else {
        return StepOutcome::failure("no container runtime configured");
    };
    let Some(image) = step.image.as_deref() else {
        return StepOutcome::failure("container step has no 'image'");
    };

    // Validate the declared resource request against the quota hierarchy.
    let mut cpu_limit = None;
    let mut memory_limit_mb = None;
    if let Some(spec) = &step.resources {
        if let Some(cpu) = &spec.cpu {
            match parse_cpu(cpu) {
                Ok(cores) => cpu_limit = Some(cores),
                Err(err) => return StepOutcome::failure(err.to_string()),
            }
        }
        if let Some(memory) = &spec.memory {
            match parse_memory_mb(memory) {
                Ok(mb) => memory_limit_mb = Some(mb),
                Err(err) => return StepOutcome::failure(err.to_string()),
            }
        }
        if let Err(err) = resources.validate_resource_request(
            source_repo,
            &step.id,
            cpu_limit.unwrap_or(0.0),
            memory_limit_mb.unwrap_or(0.0),
        ) {
            return StepOutcome::failure(err.to_string());
        }
    }

    let command = match step.run.as_deref() {
        Some(run) => match templates.expand_in_scope(run, scope) {
            Ok(command) => Some(command),
            Err(err) => return StepOutcome::failure(err.to_string()),
        },
        None => None,
    };
    let env = match step_environment(templates, step, scope, run_id, workspace, inputs) {
        Ok(env) => env,
        Err(err) => return StepOutcome::failure(err),
    };
    let work_dir = match &step.work_dir {
        Some(dir) => repo_path.join(dir),
        None => repo_path.to_path_buf(),
    };

    // Best-effort pull with a hard ceiling; a stale local image may still
    // satisfy the run.
    match tokio::time::timeout(
        Duration::from_secs(IMAGE_PULL_TIMEOUT_SECS),
        runtime.pull_image(image),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(image, %err, "image pull failed, proceeding with local image");
        }
        Err(_elapsed) => {
            tracing::warn!(image, "image pull timed out, proceeding with local image");
        }
    }

    let config = ContainerConfig {
        image: image.to_string(),
        command,
        env,
        work_dir,
        cpu_limit,
        memory_limit_mb,
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            return StepOutcome::failure("canceled: step interrupted");
        }
        result = runtime.run_container(&config) => result,
    };

    let output = match result {
        Ok(output) => output,
        Err(err) => return StepOutcome::failure(err.to_string()),
    };

    if output.exit_code != 0 {
        return StepOutcome {
            success: false,
            stdout: output.stdout.clone(),
            outputs: BTreeMap::new(),
            error: Some(format!(
                "container exited with code {}: stdout: {} stderr: {}",
                output.exit_code,
                output.stdout.trim(),
                output.stderr.trim()
            )),
        };
    }

    match extract_outputs(step.produces.as_ref(), &output.stdout, &output.stderr) {
        Ok(outputs) => StepOutcome {
            success: true,
            stdout: output.stdout,
            outputs,
            error: None,
        },
        Err(reason) => StepOutcome {
            success: false,
            stdout: output.stdout,
            outputs: BTreeMap::new(),
            error: Some(reason),
        },
    }
}

/// Injected environment plus the step's own `env` block (template-expanded).
fn step_environment(
    templates: &TemplateEngine,
    step: &WorkflowStep,
    scope: &TemplateScope,
    run_id: &str,
    workspace: &Path,
    inputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, String>, String> {
    let mut env = injected_env(run_id, &step.id, workspace, inputs);
    for (name, template) in &step.env {
        let value = if template.contains("{{") {
            templates
                .expand_in_scope(template, scope)
                .map_err(|e| e.to_string())?
        } else {
            template.clone()
        };
        env.insert(name.clone(), value);
    }
    Ok(env)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
