//! Docker container-based execution
//!
//! One ephemeral container per job: no network, read-only root filesystem,
//! a size-bounded tmpfs scratch area, every capability dropped and a
//! non-root user. Memory, CPU and process limits are set on the container
//! at creation time.
//!
//! Output is followed from start to exit into capped buffers by a separate
//! task, so whatever was captured before a timeout kill is kept. The daemon's
//! own json-file log is size-capped as well.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, HostConfigLogConfig};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::registry::{ResourceProfile, RuntimeSpec};
use crate::sandbox::classify::{detect_violations, Termination};
use crate::sandbox::output::BoundedBuffer;
use crate::sandbox::types::{ExitKind, SandboxHandle, SandboxResult};
use crate::sandbox::Sandbox;

const MB: i64 = 1024 * 1024;

/// How long the log follower may lag behind the container's exit
const LOG_DRAIN: Duration = Duration::from_secs(2);

/// Smallest json-file size kept by the daemon, in KiB
const MIN_LOG_FILE_KB: usize = 1024;

/// Demultiplexed container output, capped per stream
struct LogCapture {
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
}

impl LogCapture {
    fn new(cap: usize) -> Self {
        Self {
            stdout: BoundedBuffer::new(cap),
            stderr: BoundedBuffer::new(cap),
        }
    }

    fn record(&mut self, chunk: LogOutput) {
        match chunk {
            LogOutput::StdOut { message } => self.stdout.push(&message),
            LogOutput::StdErr { message } => self.stderr.push(&message),
            _ => {}
        }
    }
}

type SharedCapture = Arc<Mutex<LogCapture>>;

/// Move the captured buffers out, leaving empty ones behind
fn take_capture(shared: &SharedCapture, cap: usize) -> (BoundedBuffer, BoundedBuffer) {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let capture = std::mem::replace(&mut *guard, LogCapture::new(cap));
    (capture.stdout, capture.stderr)
}

/// Docker sandbox backend
pub struct DockerSandbox {
    /// Docker client
    docker: Docker,
    /// Sandbox configuration
    config: SandboxConfig,
    /// Per-stream capture cap in bytes
    output_cap: usize,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub async fn new(config: &SandboxConfig, output_cap: usize) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

        info!("Sandbox connected to Docker");

        Ok(DockerSandbox {
            docker,
            config: config.clone(),
            output_cap,
        })
    }

    /// Pull `image` unless it is already present
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image present: {}", image);
            return Ok(());
        }

        info!("Pulling Docker image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::Container(format!("Failed to pull image {}: {}", image, e)));
                }
            }
        }

        info!("Image pulled: {}", image);
        Ok(())
    }

    /// Wait for the container to stop and return its exit status
    async fn wait_for_exit(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits come back as errors from the wait endpoint
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Container(format!("Wait failed: {}", e))),
            None => Err(Error::Container("Container wait stream ended".to_string())),
        }
    }

    /// Follow the container's output into `capture` until the stream ends
    fn follow_logs(&self, name: &str, capture: SharedCapture) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&name, Some(options));

            while let Some(result) = stream.next().await {
                match result {
                    Ok(chunk) => match capture.lock() {
                        Ok(mut capture) => capture.record(chunk),
                        Err(_) => break,
                    },
                    Err(e) => {
                        warn!(container = %name, "Error reading logs: {}", e);
                        break;
                    }
                }
            }
        })
    }

    /// SIGTERM, then SIGKILL once the grace period lapses
    async fn terminate(&self, name: &str) {
        let options = StopContainerOptions {
            t: self.config.kill_grace.as_secs() as i64,
        };

        if let Err(e) = self.docker.stop_container(name, Some(options)).await {
            warn!(container = name, "Stop failed, sending SIGKILL: {}", e);
            let kill = KillContainerOptions { signal: "SIGKILL" };
            if let Err(e) = self.docker.kill_container(name, Some(kill)).await {
                warn!(container = name, "Kill failed: {}", e);
            }
        }
    }

    async fn inspect_termination(&self, name: &str, timer_fired: bool) -> Termination {
        let state = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state,
            Err(e) => {
                warn!(container = name, "Inspect failed: {}", e);
                None
            }
        };

        Termination {
            exit_code: state.as_ref().and_then(|s| s.exit_code),
            oom_killed: state.as_ref().and_then(|s| s.oom_killed).unwrap_or(false),
            timer_fired,
        }
    }
}

/// Daemon-side log limits: one json-file, a few times the capture cap
fn log_config(output_cap: usize) -> HostConfigLogConfig {
    let size_kb = (output_cap.saturating_mul(4) / 1024).max(MIN_LOG_FILE_KB);

    let mut config = HashMap::new();
    config.insert("max-size".to_string(), format!("{}k", size_kb));
    config.insert("max-file".to_string(), "1".to_string());

    HostConfigLogConfig {
        typ: Some("json-file".to_string()),
        config: Some(config),
    }
}

/// Container limits for a resource profile
fn host_config(profile: &ResourceProfile, scratch_path: &str, output_cap: usize) -> HostConfig {
    let memory = profile.memory_mb as i64 * MB;
    let exec = if profile.scratch_exec { "exec" } else { "noexec" };

    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        scratch_path.to_string(),
        format!("rw,{},nosuid,nodev,size={}m", exec, profile.scratch_mb),
    );

    HostConfig {
        memory: Some(memory),
        // Equal to memory: no swap
        memory_swap: Some(memory),
        nano_cpus: Some((profile.cpus * 1_000_000_000.0) as i64),
        pids_limit: Some(profile.pids_limit),
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        auto_remove: Some(false),
        log_config: Some(log_config(output_cap)),
        ..Default::default()
    }
}

/// Give the follower a moment to read the tail, then stop it
async fn drain(name: &str, mut follower: JoinHandle<()>) {
    if tokio::time::timeout(LOG_DRAIN, &mut follower).await.is_err() {
        warn!(container = name, "Log stream still open after exit, dropping the rest");
        follower.abort();
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self, images: &[&str]) -> Result<()> {
        for image in images {
            self.ensure_image(image).await?;
        }
        Ok(())
    }

    async fn create(&self, code: &str, spec: &RuntimeSpec) -> Result<SandboxHandle> {
        let name = format!("{}-{}", self.config.name_prefix, Uuid::new_v4().simple());

        let mut labels = HashMap::new();
        labels.insert("codexec.language".to_string(), spec.language.clone());

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command_for(code)),
            env: Some(spec.env.clone()),
            user: Some(self.config.user.clone()),
            working_dir: Some(self.config.scratch_path.clone()),
            network_disabled: Some(true),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            labels: Some(labels),
            host_config: Some(host_config(
                &spec.profile,
                &self.config.scratch_path,
                self.output_cap,
            )),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        Ok(SandboxHandle {
            id: name,
            spec: spec.clone(),
        })
    }

    async fn run(&self, handle: &SandboxHandle, timeout: Duration) -> Result<SandboxResult> {
        let name = handle.id.as_str();
        let start = Instant::now();

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))?;

        let capture = Arc::new(Mutex::new(LogCapture::new(self.output_cap)));
        let follower = self.follow_logs(name, capture.clone());

        let exit = match tokio::time::timeout(timeout, self.wait_for_exit(name)).await {
            Ok(Ok(code)) => ExitKind::Exited(code),
            Ok(Err(e)) => {
                follower.abort();
                return Err(e);
            }
            Err(_) => {
                debug!(container = name, "Timer fired after {:?}", timeout);
                self.terminate(name).await;
                if let Err(e) = self.wait_for_exit(name).await {
                    warn!(container = name, "Wait after kill failed: {}", e);
                }
                ExitKind::TimedOut
            }
        };

        drain(name, follower).await;
        let (stdout, stderr) = take_capture(&capture, self.output_cap);

        let duration = start.elapsed();
        let termination = self
            .inspect_termination(name, exit == ExitKind::TimedOut)
            .await;

        let stdout = stdout.finish();
        let stderr = stderr.finish();
        let violations = detect_violations(termination, &stderr.text, &handle.spec.profile);

        Ok(SandboxResult {
            exit,
            stdout,
            stderr,
            duration,
            violations,
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => {
                debug!("Removed container: {}", handle.id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(Error::Container(format!("Failed to remove container: {}", e))),
        }
    }
}
