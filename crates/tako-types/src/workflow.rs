//! The consumed `tako.yml` schema.
//!
//! A repository declares named workflows (ordered shell/container/builtin
//! steps with typed inputs and declared outputs), subscriptions to events
//! from other repositories, and optional directed dependents. Parsing is
//! plain serde; structural validation lives in the engine's config loader.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Repository configuration (tako.yml)
// ---------------------------------------------------------------------------

/// Parsed contents of a repository's `tako.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Schema version of the file itself (e.g. `"1"`).
    #[serde(default)]
    pub version: String,
    /// Named workflows.
    #[serde(default)]
    pub workflows: BTreeMap<String, Workflow>,
    /// Reactions to events emitted by other repositories.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    /// Directed (non-event) dependents for graph-based propagation.
    #[serde(default)]
    pub dependents: Vec<Dependent>,
}

impl RepoConfig {
    /// Parse a `tako.yml` document from YAML text. No validation beyond serde.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml_ng::Error> {
        serde_yaml_ng::from_str(yaml)
    }
}

/// A directed dependent declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependent {
    /// Dependent repository (`owner/repo`).
    pub repo: String,
    /// Workflows to trigger in the dependent; empty means its default set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<String>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A named, ordered sequence of steps with typed inputs and declared outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    /// Typed inputs, keyed by input name.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    /// Ordered step list.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Declared workflow outputs (name -> source expression).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

/// Declaration of a single workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    /// Declared type (informational at this layer).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    /// Whether the input must be supplied by the caller.
    #[serde(default)]
    pub required: bool,
    /// Default applied when the input is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Optional value constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<InputValidation>,
}

/// Value constraints for an input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputValidation {
    /// Case-sensitive enumeration of permitted values.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// A single step of a workflow.
///
/// Exactly one of `run`, `image`, `uses` selects the execution mode;
/// container steps (`image`) may additionally set `run` as the command
/// executed inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step id, unique within the workflow.
    pub id: String,
    /// Shell command template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// Container image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Builtin reference, e.g. `tako/fan-out@v1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    /// Builtin parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, Value>,
    /// Extra environment variables for the step process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Declared step outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<StepProduces>,
    /// Per-step resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<StepResources>,
}

/// The execution mode of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Builtin,
    Container,
    Shell,
}

impl WorkflowStep {
    /// Resolve the execution mode. Precedence: builtin, container, shell.
    pub fn kind(&self) -> StepKind {
        if self.uses.is_some() {
            StepKind::Builtin
        } else if self.image.is_some() {
            StepKind::Container
        } else {
            StepKind::Shell
        }
    }
}

/// Declared outputs of a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepProduces {
    /// Output name -> source. The source is `from_stdout`, `from_stderr`,
    /// or a regex whose first capture group is extracted from stdout.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Per-step resource limits, as unparsed spec strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
