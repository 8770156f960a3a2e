/**
 * PROPAGATION - pushes the best IP into configuration on remote devices
 *
 * ROLE:
 * After a successful run the new best IP is written into each enabled
 * target: a marked block of a hosts file (OpenWRT dnsmasq, mosdns) or the
 * rewrite list of an AdGuard Home config.
 *
 * OPERATION:
 * - patch computation is pure (hosts.rs, rewrites.rs) and reports `changed`
 * - read -> patch -> replace only when changed -> optional post-update command
 * - transport is the narrow RemoteConfigStore trait, SSH/SFTP in production
 * - blocking transport runs on the blocking pool, every target in parallel
 * - failures are reported per target and never touch optimization state
 */

pub mod hosts;
pub mod rewrites;
pub mod ssh;

use crate::config::{PropagationTarget, TargetFormat};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub use hosts::patch_hosts_block;
pub use rewrites::{patch_rewrite_list, PatchError};

/// Result of a pure patch computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub content: String,
    pub changed: bool,
}

impl Patch {
    pub fn unchanged(content: &str) -> Self {
        Self { content: content.to_string(), changed: false }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed for {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{path}` is not valid UTF-8")]
    NotUtf8 { path: String },
    #[error("command `{command}` exited with {code}: {stderr}")]
    CommandFailed { command: String, code: i32, stderr: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("patch failed: {0}")]
    Patch(#[from] PatchError),
    #[error("target did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("propagation task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// File read/replace/exec on one connected device. Blocking.
pub trait RemoteConfigStore {
    fn read(&mut self, path: &str) -> Result<String, RemoteError>;
    /// Replaces `path` in one step (temp file + rename on the device).
    fn replace(&mut self, path: &str, content: &str) -> Result<(), RemoteError>;
    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;
}

/// Opens a store for a target. One connection per propagation.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, target: &PropagationTarget) -> Result<Box<dyn RemoteConfigStore>, RemoteError>;
}

pub fn patch_for(format: TargetFormat, content: &str, ip: &str) -> Result<Patch, PatchError> {
    match format {
        TargetFormat::HostsBlock => Ok(patch_hosts_block(content, ip)),
        TargetFormat::RewriteList => patch_rewrite_list(content, ip),
    }
}

/// Read, patch, and write back when changed. Returns whether the file was written.
pub fn apply_to_target(
    store: &mut dyn RemoteConfigStore,
    target: &PropagationTarget,
    ip: &str,
) -> Result<bool, PropagationError> {
    let current = store.read(&target.remote_path)?;
    let patch = patch_for(target.format, &current, ip)?;
    if !patch.changed {
        return Ok(false);
    }

    store.replace(&target.remote_path, &patch.content)?;
    info!(target = %target.name, path = %target.remote_path, ip = %ip, "remote file updated");

    if let Some(command) = target.post_command() {
        let out = store.exec(command)?;
        if out.exit_code != 0 {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        info!(target = %target.name, command, "post-update command succeeded");
    }
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PropagationStatus {
    Updated,
    Unchanged,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PropagationReport {
    pub target: String,
    pub host: String,
    pub remote_path: String,
    #[serde(flatten)]
    pub status: PropagationStatus,
}

/// Connect, read, replace, post command.
const STEPS_PER_TARGET: u32 = 4;

pub struct Propagator {
    connector: Arc<dyn RemoteConnector>,
    targets: Vec<PropagationTarget>,
}

impl Propagator {
    /// Keeps only enabled targets.
    pub fn new(connector: Arc<dyn RemoteConnector>, targets: Vec<PropagationTarget>) -> Self {
        let targets = targets.into_iter().filter(|t| t.enabled).collect();
        Self { connector, targets }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self) -> &[PropagationTarget] {
        &self.targets
    }

    /// Applies `ip` to every target concurrently. Never fails as a whole.
    pub async fn propagate(&self, ip: &str) -> Vec<PropagationReport> {
        let jobs = self.targets.iter().cloned().map(|target| {
            let connector = self.connector.clone();
            let ip = ip.to_string();
            async move {
                let budget = Duration::from_secs(target.timeout_seconds) * STEPS_PER_TARGET;
                let task_target = target.clone();
                let task = tokio::task::spawn_blocking(move || {
                    let mut store = connector.connect(&task_target)?;
                    apply_to_target(store.as_mut(), &task_target, &ip)
                });
                let result = match tokio::time::timeout(budget, task).await {
                    Ok(Ok(r)) => r,
                    Ok(Err(join)) => Err(PropagationError::Join(join.to_string())),
                    Err(_) => Err(PropagationError::TimedOut(budget)),
                };
                report(&target, result)
            }
        });
        futures::future::join_all(jobs).await
    }
}

fn report(target: &PropagationTarget, result: Result<bool, PropagationError>) -> PropagationReport {
    let status = match result {
        Ok(true) => PropagationStatus::Updated,
        Ok(false) => {
            info!(target = %target.name, "remote file already up to date");
            PropagationStatus::Unchanged
        }
        Err(e) => {
            error!(
                target = %target.name,
                host = %target.host,
                path = %target.remote_path,
                "propagation failed: {}",
                e
            );
            PropagationStatus::Failed { error: e.to_string() }
        }
    };
    PropagationReport {
        target: target.name.clone(),
        host: target.host.clone(),
        remote_path: target.remote_path.clone(),
        status,
    }
}
