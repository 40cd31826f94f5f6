use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::DockerConfig;
use crate::runtime::{
    ContainerRecord, ContainerRuntime, ContainerStatus, LaunchSpec, LogOptions, RuntimeError,
    RuntimeResult,
};

/// Mount point of the run directory inside the container.
const WORKDIR: &str = "/workdir";

/// Drives precheck containers through the `docker` CLI.
///
/// Containers run detached with:
/// - The run directory bind-mounted read-write at `/workdir`
/// - Labels linking the container back to its run
/// - Optional memory/CPU limits and network isolation
/// - `no-new-privileges`
#[derive(Debug, Clone)]
pub struct DockerCli {
    config: DockerConfig,
    binary: String,
}

impl DockerCli {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            binary: "docker".to_string(),
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn container_name(&self, run_id: &Uuid) -> String {
        format!("{}{}", self.config.container_prefix, run_id)
    }

    fn run_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(&spec.run_id),
            "-v".to_string(),
            format!("{}:{}:rw", spec.work_dir.display(), WORKDIR),
            "--label".to_string(),
            format!("precheck.run_id={}", spec.run_id),
            "--label".to_string(),
            format!("precheck.top_cell={}", spec.top_cell),
            "--label".to_string(),
            format!("precheck.die_id={}", spec.die_id),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }
        args.push("--security-opt=no-new-privileges".to_string());

        args.push(self.config.image.clone());
        args.extend(
            [
                "python",
                "precheck.py",
                "--input",
                "/workdir/input.gds",
                "--top",
                spec.top_cell.as_str(),
                "--id",
                spec.die_id.as_str(),
                "--dir",
                WORKDIR,
            ]
            .map(String::from),
        );
        args
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> RuntimeResult<Output> {
        let command = describe(&self.binary, args);
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(RuntimeError::Spawn { command, source }),
            Err(_) => Err(RuntimeError::Timeout { command, timeout }),
        }
    }

    /// Run a command against one container. `Ok(None)` if docker reports the
    /// container does not exist.
    async fn docker_for(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> RuntimeResult<Option<Output>> {
        let output = self.docker(args, timeout).await?;
        if output.status.success() {
            return Ok(Some(output));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            return Ok(None);
        }
        Err(RuntimeError::CommandFailed {
            command: describe(&self.binary, args),
            code: output.status.code(),
            stderr: stderr.trim().to_string(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerRecord>> {
        let filter = format!("name={}", self.config.container_prefix);
        let args: Vec<String> = [
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            filter.as_str(),
            "--format",
            "{{json .}}",
        ]
        .map(String::from)
        .to_vec();

        let output = self.docker(&args, self.config.command_timeout()).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: describe(&self.binary, &args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_ps_output(
            &String::from_utf8_lossy(&output.stdout),
            &self.config.container_prefix,
        )
        .map_err(|reason| RuntimeError::Decode {
            command: describe(&self.binary, &args),
            reason,
        })
    }

    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<String> {
        tracing::info!(
            run_id = %spec.run_id,
            top_cell = %spec.top_cell,
            image = %self.config.image,
            "Starting precheck container"
        );

        let args = self.run_args(spec);
        let output = self.docker(&args, self.config.command_timeout()).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: describe(&self.binary, &args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Decode {
                command: describe(&self.binary, &args),
                reason: "no container id printed".to_string(),
            });
        }
        Ok(id)
    }

    async fn status(&self, handle: &str) -> RuntimeResult<Option<ContainerStatus>> {
        let args: Vec<String> = ["inspect", "--format", "{{json .State}}", handle]
            .map(String::from)
            .to_vec();
        let Some(output) = self.docker_for(&args, self.config.command_timeout()).await? else {
            return Ok(None);
        };
        parse_state(&String::from_utf8_lossy(&output.stdout))
            .map(Some)
            .map_err(|reason| RuntimeError::Decode {
                command: describe(&self.binary, &args),
                reason,
            })
    }

    async fn logs(&self, handle: &str, options: &LogOptions) -> RuntimeResult<Option<String>> {
        let mut args = vec!["logs".to_string()];
        if let Some(since) = options.since {
            args.push(format!("--since={}", since));
        }
        if let Some(tail) = options.tail {
            args.push(format!("--tail={}", tail));
        }
        if options.timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(handle.to_string());

        let Some(output) = self.docker_for(&args, self.config.command_timeout()).await? else {
            return Ok(None);
        };
        // docker replays the container's stderr on its own stderr
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(Some(text))
    }

    async fn stats(&self, handle: &str) -> RuntimeResult<Option<serde_json::Value>> {
        let args: Vec<String> = ["stats", "--no-stream", "--format", "{{json .}}", handle]
            .map(String::from)
            .to_vec();
        let Some(output) = self.docker_for(&args, self.config.command_timeout()).await? else {
            return Ok(None);
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim())
            .map(Some)
            .map_err(|e| RuntimeError::Decode {
                command: describe(&self.binary, &args),
                reason: e.to_string(),
            })
    }

    async fn stop_and_remove(&self, handle: &str, timeout: Duration) -> RuntimeResult<bool> {
        // `docker stop` itself waits up to `timeout` before killing
        let call_timeout = self.config.command_timeout().max(timeout + Duration::from_secs(5));

        let stop: Vec<String> = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout.as_secs().to_string(),
            handle.to_string(),
        ];
        if self.docker_for(&stop, call_timeout).await?.is_none() {
            return Ok(false);
        }

        let rm: Vec<String> = ["rm", "-f", handle].map(String::from).to_vec();
        let removed = self
            .docker_for(&rm, self.config.command_timeout())
            .await?
            .is_some();
        tracing::debug!(container = %handle, removed, "Container stopped");
        Ok(removed)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct DockerState {
    status: String,
    running: bool,
    exit_code: i32,
    error: String,
    started_at: String,
    finished_at: String,
}

/// Parse `docker ps --format {{json .}}` output, keeping only names that
/// start with `prefix` (docker's name filter is a substring match).
fn parse_ps_output(stdout: &str, prefix: &str) -> Result<Vec<ContainerRecord>, String> {
    let mut records = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let ps: PsLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
        let Some(name) = ps
            .names
            .split(',')
            .map(|n| n.trim().trim_start_matches('/'))
            .find(|n| n.starts_with(prefix))
        else {
            continue;
        };
        records.push(ContainerRecord {
            id: ps.id,
            name: name.to_string(),
            state: ps.state.to_lowercase(),
        });
    }
    Ok(records)
}

fn parse_state(stdout: &str) -> Result<ContainerStatus, String> {
    let state: DockerState = serde_json::from_str(stdout.trim()).map_err(|e| e.to_string())?;
    let exited = matches!(state.status.as_str(), "exited" | "dead");
    Ok(ContainerStatus {
        running: state.running,
        exited: exited && !state.running,
        exit_code: state.exit_code,
        error: Some(state.error).filter(|e| !e.is_empty()),
        started_at: parse_docker_time(&state.started_at),
        finished_at: parse_docker_time(&state.finished_at),
    })
}

/// Docker reports unset times as `0001-01-01T00:00:00Z`.
fn parse_docker_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.year() > 1)
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

fn describe(binary: &str, args: &[String]) -> String {
    match args.first() {
        Some(sub) => format!("{} {}", binary, sub),
        None => binary.to_string(),
    }
}
