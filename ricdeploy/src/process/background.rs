//! Scoped background helper processes.
//!
//! A [`BackgroundSession`] owns every helper it starts (port-forward tunnels,
//! log followers). Helpers are released exactly once, in reverse start order,
//! when the session ends: on normal completion, on error and on Ctrl-C. A
//! session dropped without being released still kills its children.

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::exec::CommandSpec;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Identifies a helper process started by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundHandle {
    id: u64,
    /// OS process id.
    pub process_id: u32,
    /// When the process was started.
    pub started_at: DateTime<Utc>,
    /// What the process is for.
    pub label: String,
}

struct Tracked {
    handle: BackgroundHandle,
    child: Child,
}

/// Owns background helpers for the lifetime of a session.
pub struct BackgroundSession {
    tracked: Mutex<Vec<Tracked>>,
    next_id: AtomicU64,
    stop_timeout: Duration,
}

impl Default for BackgroundSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundSession {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Sets how long a helper gets to exit after SIGTERM before it is killed.
    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Launches `command` without waiting for it.
    pub fn start(
        &self,
        label: impl Into<String>,
        command: &CommandSpec,
    ) -> Result<BackgroundHandle, DeployError> {
        let label = label.into();
        let mut cmd = command.to_tokio();
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| DeployError::ExternalTool {
            command: command.to_string(),
            code: None,
            stderr: format!("failed to spawn: {e}"),
        })?;
        let process_id = child.id().ok_or_else(|| DeployError::ExternalTool {
            command: command.to_string(),
            code: None,
            stderr: "process exited before it could be tracked".to_string(),
        })?;

        let handle = BackgroundHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            process_id,
            started_at: Utc::now(),
            label,
        };
        info!(label = %handle.label, pid = process_id, command = %command, "Started background process");
        self.tracked.lock().push(Tracked {
            handle: handle.clone(),
            child,
        });
        Ok(handle)
    }

    /// Number of helpers not yet released.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Terminates the helper behind `handle`.
    ///
    /// Returns false if the handle was already released.
    pub async fn release(&self, handle: &BackgroundHandle) -> bool {
        let tracked = {
            let mut guard = self.tracked.lock();
            guard
                .iter()
                .position(|t| t.handle.id == handle.id)
                .map(|index| guard.remove(index))
        };
        match tracked {
            Some(tracked) => {
                self.stop(tracked).await;
                true
            }
            None => false,
        }
    }

    /// Releases every helper, most recently started first.
    pub async fn release_all(&self) -> Vec<BackgroundHandle> {
        let drained: Vec<Tracked> = std::mem::take(&mut *self.tracked.lock());
        let mut released = Vec::with_capacity(drained.len());
        for tracked in drained.into_iter().rev() {
            released.push(tracked.handle.clone());
            self.stop(tracked).await;
        }
        released
    }

    async fn stop(&self, mut tracked: Tracked) {
        let Tracked { handle, child } = &mut tracked;

        if let Ok(Some(status)) = child.try_wait() {
            debug!(label = %handle.label, pid = handle.process_id, %status, "Background process already exited");
            return;
        }

        if let Ok(pid) = i32::try_from(handle.process_id) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(label = %handle.label, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(label = %handle.label, pid = handle.process_id, %status, "Background process stopped");
            }
            Ok(Err(e)) => {
                warn!(label = %handle.label, error = %e, "Failed waiting for background process");
            }
            Err(_) => {
                warn!(
                    label = %handle.label,
                    pid = handle.process_id,
                    timeout_ms = self.stop_timeout.as_millis(),
                    "Background process ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(label = %handle.label, error = %e, "Failed to kill background process");
                }
            }
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        for tracked in self.tracked.get_mut().iter_mut() {
            warn!(label = %tracked.handle.label, pid = tracked.handle.process_id, "Killing unreleased background process");
            let _ = tracked.child.start_kill();
        }
    }
}

impl std::fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSession")
            .field("active_count", &self.active_count())
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

/// How a scoped session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEnd<T> {
    /// The foreground work finished.
    Completed(T),
    /// The session was interrupted first.
    Interrupted,
}

impl<T> ScopeEnd<T> {
    /// Returns true if the session was interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Runs `work` until it finishes or Ctrl-C arrives, then releases every
/// helper in `session`.
pub async fn run_scoped<F, T>(session: &BackgroundSession, work: F) -> ScopeEnd<T>
where
    F: Future<Output = T>,
{
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    run_scoped_until(session, work, interrupt).await
}

/// Like [`run_scoped`] with a caller-supplied interrupt.
pub async fn run_scoped_until<F, T, I>(session: &BackgroundSession, work: F, interrupt: I) -> ScopeEnd<T>
where
    F: Future<Output = T>,
    I: Future<Output = ()>,
{
    let end = tokio::select! {
        value = work => ScopeEnd::Completed(value),
        () = interrupt => {
            info!("Session interrupted");
            ScopeEnd::Interrupted
        }
    };
    let released = session.release_all().await;
    debug!(released = released.len(), "Session closed");
    end
}
