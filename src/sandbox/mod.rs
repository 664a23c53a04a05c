//! Sandbox module - isolated execution of untrusted code
//!
//! - `Sandbox`: the isolation capability (`create` / `run` / `destroy`)
//! - `SandboxRunner`: drives one execution and guarantees `destroy`
//! - `DockerSandbox`: ephemeral, locked-down Docker containers
//!
//! Every execution gets a fresh sandbox. Limits are applied when it is
//! created, before any user code runs.

mod classify;
mod container;
mod output;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use classify::{detect_violations, Termination};
pub use container::DockerSandbox;
pub use output::{truncate_to_cap, BoundedBuffer, CapturedOutput, TRUNCATION_MARKER};
pub use types::{ExitKind, SandboxHandle, SandboxResult};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::{LanguageRegistry, RuntimeSpec};

/// Isolation backend
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Warm up before the first job (pull images)
    async fn prepare(&self, _images: &[&str]) -> Result<()> {
        Ok(())
    }

    /// Materialize `code` into a fresh sandbox with the runtime's limits applied
    async fn create(&self, code: &str, spec: &RuntimeSpec) -> Result<SandboxHandle>;

    /// Start the sandbox and supervise it until exit or `timeout`
    async fn run(&self, handle: &SandboxHandle, timeout: Duration) -> Result<SandboxResult>;

    /// Tear the sandbox down. Must tolerate sandboxes that are already gone.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Runs one job's code in its own sandbox
#[derive(Clone)]
pub struct SandboxRunner {
    sandbox: Arc<dyn Sandbox>,
    output_cap: usize,
}

impl SandboxRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, output_cap: usize) -> Self {
        SandboxRunner { sandbox, output_cap }
    }

    pub fn name(&self) -> &str {
        self.sandbox.name()
    }

    /// Byte cap applied to `output` and `error`
    pub fn output_cap(&self) -> usize {
        self.output_cap
    }

    /// Pre-pull every registered runtime image
    pub async fn prepare(&self, registry: &LanguageRegistry) -> Result<()> {
        self.sandbox.prepare(&registry.images()).await
    }

    /// Execute `code` under `spec`. The sandbox is destroyed on every path,
    /// including cancellation of this future.
    pub async fn run(
        &self,
        code: &str,
        spec: &RuntimeSpec,
        timeout_seconds: u64,
    ) -> Result<SandboxResult> {
        let handle = self.sandbox.create(code, spec).await?;
        debug!(sandbox = %handle.id, language = %spec.language, "Created sandbox");

        let guard = DestroyGuard {
            sandbox: self.sandbox.clone(),
            handle: Some(handle.clone()),
        };

        let result = self
            .sandbox
            .run(&handle, Duration::from_secs(timeout_seconds))
            .await;

        guard.destroy().await;
        result
    }
}

/// Destroys the sandbox when dropped without an explicit `destroy`
struct DestroyGuard {
    sandbox: Arc<dyn Sandbox>,
    handle: Option<SandboxHandle>,
}

impl DestroyGuard {
    async fn destroy(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.sandbox.destroy(&handle).await {
                warn!(sandbox = %handle.id, "Failed to destroy sandbox: {}", e);
            }
        }
    }
}

impl Drop for DestroyGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let sandbox = self.sandbox.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = sandbox.destroy(&handle).await {
                        warn!(sandbox = %handle.id, "Failed to destroy abandoned sandbox: {}", e);
                    }
                });
            }
            Err(_) => warn!(sandbox = %handle.id, "No runtime available to destroy sandbox"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSandbox;
    use super::*;
    use crate::config::SandboxConfig;

    fn python() -> RuntimeSpec {
        LanguageRegistry::from_config(&SandboxConfig::default())
            .unwrap()
            .resolve("python")
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_run_destroys_sandbox() {
        let sandbox = Arc::new(ScriptedSandbox::new());
        let runner = SandboxRunner::new(sandbox.clone(), 4000);

        let result = runner.run("print(1)", &python(), 5).await.unwrap();
        assert_eq!(result.exit, ExitKind::Exited(0));
        assert_eq!(result.stdout.text, "print(1)");
        assert_eq!(sandbox.created(), 1);
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test]
    async fn test_failed_run_still_destroys() {
        let sandbox = Arc::new(ScriptedSandbox::new().failing_runs(1));
        let runner = SandboxRunner::new(sandbox.clone(), 4000);

        assert!(runner.run("print(1)", &python(), 5).await.is_err());
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_destroys_via_guard() {
        let sandbox = Arc::new(ScriptedSandbox::new().with_delay(Duration::from_secs(10)));
        let runner = SandboxRunner::new(sandbox.clone(), 4000);
        let spec = python();

        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), runner.run("print(1)", &spec, 30)).await;
        assert!(cancelled.is_err());

        // Let the spawned cleanup run
        tokio::task::yield_now().await;
        assert_eq!(sandbox.created(), 1);
        assert_eq!(sandbox.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let sandbox = Arc::new(ScriptedSandbox::new());
        let runner = SandboxRunner::new(sandbox.clone(), 4000);

        let result = runner.run("sleep", &python(), 2).await.unwrap();
        assert_eq!(result.exit, ExitKind::TimedOut);
        assert_eq!(result.duration, Duration::from_secs(2));
    }
}
