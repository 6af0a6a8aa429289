//! The container runtime port.
//!
//! The engine never talks to a container daemon directly; it goes through
//! [`ContainerRuntime`], a capability contract implemented by the infra
//! layer (and by in-memory fakes in tests). The `*Dyn` twin with boxed
//! futures enables dynamic dispatch:
//!
//! 1. Define the RPITIT trait.
//! 2. Define an object-safe `ContainerRuntimeDyn` with boxed futures.
//! 3. Blanket-impl the twin for all implementors.
//! 4. `BoxContainerRuntime` wraps `Box<dyn ContainerRuntimeDyn>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;

/// Ceiling on best-effort image pulls.
pub const IMAGE_PULL_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("container run failed: {0}")]
    Run(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Config / output
// ---------------------------------------------------------------------------

/// Everything needed to run one container step.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    /// Command executed inside the container (`sh -c <command>`); the
    /// image's default entrypoint runs when absent.
    pub command: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Host directory mounted read-write as the container's working dir.
    pub work_dir: PathBuf,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<f64>,
}

/// Captured result of a container run.
#[derive(Debug, Clone)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Capability contract for pulling images and running containers.
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image. Callers treat failures as warnings and bound the
    /// wait with [`IMAGE_PULL_TIMEOUT_SECS`].
    fn pull_image(
        &self,
        image: &str,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Run a container to completion, capturing stdout/stderr/exit code.
    fn run_container(
        &self,
        config: &ContainerConfig,
    ) -> impl Future<Output = Result<ContainerOutput, RuntimeError>> + Send;
}

/// Object-safe twin of [`ContainerRuntime`] with boxed futures.
pub trait ContainerRuntimeDyn: Send + Sync {
    fn pull_image_boxed<'a>(
        &'a self,
        image: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send + 'a>>;

    fn run_container_boxed<'a>(
        &'a self,
        config: &'a ContainerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ContainerOutput, RuntimeError>> + Send + 'a>>;
}

impl<T: ContainerRuntime> ContainerRuntimeDyn for T {
    fn pull_image_boxed<'a>(
        &'a self,
        image: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RuntimeError>> + Send + 'a>> {
        Box::pin(self.pull_image(image))
    }

    fn run_container_boxed<'a>(
        &'a self,
        config: &'a ContainerConfig,
    ) -> Pin<Box<dyn Future<Output = Result<ContainerOutput, RuntimeError>> + Send + 'a>> {
        Box::pin(self.run_container(config))
    }
}

/// Type-erased container runtime.
pub struct BoxContainerRuntime(Box<dyn ContainerRuntimeDyn>);

impl BoxContainerRuntime {
    pub fn new(runtime: impl ContainerRuntime + 'static) -> Self {
        Self(Box::new(runtime))
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.0.pull_image_boxed(image).await
    }

    pub async fn run_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ContainerOutput, RuntimeError> {
        self.0.run_container_boxed(config).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
