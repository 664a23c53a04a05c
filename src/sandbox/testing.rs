//! In-process sandbox with scripted behavior, for runner and worker tests.
//!
//! `run` echoes the code back as stdout, so concurrent jobs can be checked
//! for cross-contamination. A few code values are special:
//! - `sleep`: runs out the timeout and reports `TimedOut`
//! - `fail`: exits 1 with the code on stderr

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::registry::RuntimeSpec;
use crate::sandbox::{Sandbox, SandboxHandle, SandboxResult};

#[derive(Default)]
pub(crate) struct ScriptedSandbox {
    created: AtomicUsize,
    failing_runs: AtomicUsize,
    delay: Duration,
    live: Mutex<HashMap<String, String>>,
}

impl ScriptedSandbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `count` runs fail as if the backend crashed
    pub(crate) fn failing_runs(self, count: usize) -> Self {
        self.failing_runs.store(count, Ordering::SeqCst);
        self
    }

    /// Every run takes at least `delay`
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn live(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, code: &str, spec: &RuntimeSpec) -> Result<SandboxHandle> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("scripted-{}", Uuid::new_v4().simple());
        self.live
            .lock()
            .map_err(|_| Error::Internal("poisoned".into()))?
            .insert(id.clone(), code.to_string());
        Ok(SandboxHandle {
            id,
            spec: spec.clone(),
        })
    }

    async fn run(&self, handle: &SandboxHandle, timeout: Duration) -> Result<SandboxResult> {
        let code = self
            .live
            .lock()
            .map_err(|_| Error::Internal("poisoned".into()))?
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::Sandbox(format!("unknown sandbox {}", handle.id)))?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failing_runs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Container("scripted backend failure".into()));
        }

        match code.as_str() {
            "sleep" => {
                tokio::time::sleep(timeout).await;
                Ok(SandboxResult::timed_out("", "", timeout))
            }
            "fail" => Ok(SandboxResult::exited(1, "", code, self.delay)),
            _ => Ok(SandboxResult::exited(0, code, "", self.delay)),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        self.live
            .lock()
            .map_err(|_| Error::Internal("poisoned".into()))?
            .remove(&handle.id);
        Ok(())
    }
}
