//! Container runtime adapter shelling out to the `docker` CLI.
//!
//! The step's working directory is mounted read-write at `/workspace`
//! inside the container, environment variables are forwarded with `-e`,
//! and declared CPU/memory limits map to `--cpus` / `--memory`.

use tako_core::runtime::{ContainerConfig, ContainerOutput, ContainerRuntime, RuntimeError};

/// Mount point of the step working directory inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// `ContainerRuntime` implementation backed by the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Argument vector for `docker run` on the given config.
    fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKSPACE}", config.work_dir.display()),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
        ];
        for (name, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{name}={value}"));
        }
        if let Some(cpus) = config.cpu_limit {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory_mb) = config.memory_limit_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", memory_mb.ceil() as u64));
        }
        args.push(config.image.clone());
        if let Some(command) = &config.command {
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(command.clone());
        }
        args
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerRuntime for DockerCliRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        tracing::debug!(image, "pulling container image");
        let output = tokio::process::Command::new(&self.binary)
            .args(["pull", image])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Pull(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn run_container(
        &self,
        config: &ContainerConfig,
    ) -> Result<ContainerOutput, RuntimeError> {
        let args = Self::run_args(config);
        tracing::debug!(image = config.image.as_str(), "running container");
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(ContainerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn config() -> ContainerConfig {
        ContainerConfig {
            image: "ghcr.io/ex/tool:1".to_string(),
            command: Some("make release".to_string()),
            env: BTreeMap::from([
                ("TAKO_RUN_ID".to_string(), "exec-1".to_string()),
                ("REGISTRY".to_string(), "ghcr.io".to_string()),
            ]),
            work_dir: PathBuf::from("/cache/repos/ex/lib/main"),
            cpu_limit: Some(1.5),
            memory_limit_mb: Some(512.0),
        }
    }

    #[test]
    fn run_args_shape() {
        let args = DockerCliRuntime::run_args(&config());
        assert_eq!(args[0], "run");
        assert_eq!(args[1], "--rm");
        assert!(args.contains(&"-v".to_string()));
        assert!(args.contains(&"/cache/repos/ex/lib/main:/workspace".to_string()));
        assert!(args.contains(&"REGISTRY=ghcr.io".to_string()));
        assert!(args.contains(&"--cpus".to_string()));
        assert!(args.contains(&"1.5".to_string()));
        assert!(args.contains(&"--memory".to_string()));
        assert!(args.contains(&"512m".to_string()));

        // Image comes before the command.
        let image_pos = args.iter().position(|a| a == "ghcr.io/ex/tool:1").unwrap();
        let sh_pos = args.iter().position(|a| a == "sh").unwrap();
        assert!(image_pos < sh_pos);
        assert_eq!(args.last().unwrap(), "make release");
    }

    #[test]
    fn run_args_without_command_uses_entrypoint() {
        let mut cfg = config();
        cfg.command = None;
        cfg.cpu_limit = None;
        cfg.memory_limit_mb = None;
        let args = DockerCliRuntime::run_args(&cfg);
        assert_eq!(args.last().unwrap(), "ghcr.io/ex/tool:1");
        assert!(!args.contains(&"--cpus".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let runtime = DockerCliRuntime::new("definitely-not-a-container-binary");
        let err = runtime.pull_image("alpine:3").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
    }
}
