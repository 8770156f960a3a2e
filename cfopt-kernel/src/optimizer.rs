/**
 * OPTIMIZER - one admitted speed-test run, from spawn to commit
 *
 * OPERATION:
 * 1. take the execution guard (refused -> Skipped, nothing else happens)
 * 2. delete the previous result artifact
 * 3. spawn the tool in its work dir with the configured argv, stdout/stderr
 *    streamed into the log, bounded by speedtest.timeout_seconds
 * 4. exit 0 -> read + parse the artifact -> commit best IP and results
 * 5. propagate the new best IP to the enabled targets (permit still held)
 * 6. the permit drops on every path, panics included
 *
 * A failed run leaves the shared state exactly as it was.
 */

use crate::config::{build_tool_args, SpeedTestConf};
use crate::guard::{ExecutionGuard, GuardPermit};
use crate::models::{ParseDiagnostics, ResultRecord};
use crate::parser;
use crate::propagation::{PropagationReport, Propagator};
use crate::state::{new_state, Shared, SharedOptimizationState};
use futures::FutureExt;
use serde::Serialize;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Exit code, or -1 when the tool was killed by a signal.
    NonZero(i32),
    TimedOut,
    NotFound,
    SpawnFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("speed-test tool not found at {0}")]
    ToolNotInstalled(PathBuf),
    #[error("failed to start speed-test tool: {0}")]
    Spawn(io::Error),
    #[error("speed-test tool exited with code {code}")]
    NonZeroExit { code: i32 },
    #[error("speed-test tool timed out after {0:?}")]
    TimedOut(Duration),
    #[error("result file {0} was not produced")]
    ArtifactMissing(PathBuf),
    #[error("result file {path} unreadable: {source}")]
    ArtifactUnreadable { path: PathBuf, source: io::Error },
    #[error("internal error during run: {0}")]
    Internal(String),
}

/// One invocation of the tool.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRun {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// `None` when the run died before the tool's fate was known.
    pub exit_status: Option<ExitStatus>,
    pub raw_output_lines: Vec<String>,
    pub records: Vec<ResultRecord>,
    pub diagnostics: ParseDiagnostics,
    pub propagation: Vec<PropagationReport>,
}

impl OptimizationRun {
    fn started(at: OffsetDateTime) -> Self {
        Self {
            started_at: at,
            finished_at: at,
            exit_status: None,
            raw_output_lines: Vec::new(),
            records: Vec::new(),
            diagnostics: ParseDiagnostics::default(),
            propagation: Vec::new(),
        }
    }

    pub fn best_ip(&self) -> Option<&str> {
        self.records.first().map(|r| r.ip.as_str()).filter(|ip| !ip.is_empty())
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Another run held the guard.
    Skipped,
    Succeeded(OptimizationRun),
    Failed { run: OptimizationRun, error: RunError },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped)
    }
}

/// Summary of the last finished run, as served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub succeeded: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub exit_status: Option<ExitStatus>,
    pub records: usize,
    pub best_ip: Option<String>,
    pub diagnostics: ParseDiagnostics,
    pub error: Option<String>,
    pub propagation: Vec<PropagationReport>,
}

impl RunReport {
    pub fn from_outcome(outcome: &RunOutcome) -> Option<Self> {
        let (run, error) = match outcome {
            RunOutcome::Skipped => return None,
            RunOutcome::Succeeded(run) => (run, None),
            RunOutcome::Failed { run, error } => (run, Some(error.to_string())),
        };
        Some(Self {
            succeeded: error.is_none(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            exit_status: run.exit_status,
            records: run.records.len(),
            best_ip: run.best_ip().map(str::to_string),
            diagnostics: run.diagnostics.clone(),
            error,
            propagation: run.propagation.clone(),
        })
    }
}

pub struct Optimizer {
    conf: SpeedTestConf,
    state: SharedOptimizationState,
    guard: Arc<dyn ExecutionGuard>,
    propagator: Option<Propagator>,
    last_report: Shared<Option<RunReport>>,
}

impl Optimizer {
    pub fn new(
        conf: SpeedTestConf,
        state: SharedOptimizationState,
        guard: Arc<dyn ExecutionGuard>,
        propagator: Option<Propagator>,
    ) -> Self {
        let propagator = propagator.filter(|p| !p.is_empty());
        Self { conf, state, guard, propagator, last_report: new_state(None) }
    }

    pub fn state(&self) -> &SharedOptimizationState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_held()
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report.lock().clone()
    }

    /// Runs the tool once unless a run is already in flight.
    pub async fn run_once(&self) -> RunOutcome {
        match GuardPermit::try_acquire(&self.guard) {
            Some(permit) => self.run_with_permit(permit).await,
            None => {
                debug!("run refused: guard held");
                RunOutcome::Skipped
            }
        }
    }

    /// Takes the guard now and runs on a new task. `None` when a run is in flight,
    /// so callers can answer "busy" without racing the guard.
    pub fn try_start(self: &Arc<Self>) -> Option<JoinHandle<RunOutcome>> {
        let permit = GuardPermit::try_acquire(&self.guard)?;
        let this = self.clone();
        Some(tokio::spawn(async move { this.run_with_permit(permit).await }))
    }

    async fn run_with_permit(&self, permit: GuardPermit) -> RunOutcome {
        let started_at = OffsetDateTime::now_utc();
        info!("speed test started");

        let outcome = match AssertUnwindSafe(self.run_admitted(started_at)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let mut run = OptimizationRun::started(started_at);
                run.finished_at = OffsetDateTime::now_utc();
                RunOutcome::Failed { run, error: RunError::Internal(msg) }
            }
        };

        match &outcome {
            RunOutcome::Succeeded(run) => info!(
                records = run.records.len(),
                best_ip = run.best_ip().unwrap_or("-"),
                "speed test finished"
            ),
            RunOutcome::Failed { error, .. } => error!("speed test failed: {}", error),
            RunOutcome::Skipped => {}
        }
        *self.last_report.lock() = RunReport::from_outcome(&outcome);
        drop(permit);
        outcome
    }

    async fn run_admitted(&self, started_at: OffsetDateTime) -> RunOutcome {
        let mut run = OptimizationRun::started(started_at);
        let output = self.conf.output_path();

        match fs::remove_file(&output).await {
            Ok(()) => debug!("removed stale result file {}", output.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove stale result file {}: {}", output.display(), e),
        }

        let (status, lines) = self.execute_tool().await;
        run.raw_output_lines = lines;
        run.finished_at = OffsetDateTime::now_utc();
        let status = match status {
            Ok(status) => status,
            Err((status, error)) => {
                run.exit_status = Some(status);
                return RunOutcome::Failed { run, error };
            }
        };
        run.exit_status = Some(status);
        if let ExitStatus::NonZero(code) = status {
            return RunOutcome::Failed { run, error: RunError::NonZeroExit { code } };
        }

        let raw = match fs::read(&output).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return RunOutcome::Failed { run, error: RunError::ArtifactMissing(output) };
            }
            Err(source) => {
                return RunOutcome::Failed { run, error: RunError::ArtifactUnreadable { path: output, source } };
            }
        };

        let report = parser::parse(&raw);
        log_diagnostics(&report.diagnostics);
        run.diagnostics = report.diagnostics;
        run.records = report.records;

        let snapshot = self.state.commit(run.records.clone());

        if let (Some(propagator), Some(ip)) = (&self.propagator, snapshot.best_ip.as_deref()) {
            run.propagation = propagator.propagate(ip).await;
        }
        RunOutcome::Succeeded(run)
    }

    /// Spawns the tool and waits for it. Output lines are logged as they arrive.
    async fn execute_tool(&self) -> (Result<ExitStatus, (ExitStatus, RunError)>, Vec<String>) {
        let binary = self.conf.binary_path();
        let args = build_tool_args(&self.conf);
        debug!("exec {} {}", binary.display(), args.join(" "));

        let spawned = Command::new(&binary)
            .args(&args)
            .current_dir(self.conf.work_dir_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return (Err((ExitStatus::NotFound, RunError::ToolNotInstalled(binary))), Vec::new());
            }
            Err(e) => return (Err((ExitStatus::SpawnFailed, RunError::Spawn(e))), Vec::new()),
        };

        let lines = new_state(Vec::new());
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(out, lines.clone(), false)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(err, lines.clone(), true)));
        }

        let limit = Duration::from_secs(self.conf.timeout_seconds);
        let deadline = Instant::now() + limit;
        let result = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // leftover children of the tool can keep the pipes open past its exit
                drain_readers(readers, deadline.max(Instant::now() + OUTPUT_GRACE)).await;
                match status.code() {
                    Some(0) => Ok(ExitStatus::Success),
                    Some(code) => Ok(ExitStatus::NonZero(code)),
                    None => Ok(ExitStatus::NonZero(-1)),
                }
            }
            Ok(Err(e)) => Err((ExitStatus::SpawnFailed, RunError::Spawn(e))),
            Err(_) => {
                warn!("speed test exceeded {:?}, killing it", limit);
                if let Err(e) = child.kill().await {
                    warn!("failed to kill speed-test tool: {}", e);
                }
                for r in readers {
                    r.abort();
                }
                Err((ExitStatus::TimedOut, RunError::TimedOut(limit)))
            }
        };

        let lines = std::mem::take(&mut *lines.lock());
        (result, lines)
    }

    /// Loads a result file left by an earlier process without running the tool.
    /// `Ok(None)` when there is no file or a run is in flight.
    pub async fn load_existing_results(&self) -> Result<Option<usize>, RunError> {
        let Some(_permit) = GuardPermit::try_acquire(&self.guard) else {
            return Ok(None);
        };
        let output = self.conf.output_path();
        let raw = match fs::read(&output).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RunError::ArtifactUnreadable { path: output, source }),
        };
        let report = parser::parse(&raw);
        log_diagnostics(&report.diagnostics);
        let count = report.records.len();
        let snapshot = self.state.commit(report.records);
        info!(
            records = count,
            best_ip = snapshot.best_ip.as_deref().unwrap_or("-"),
            "loaded existing results from {}",
            output.display()
        );
        Ok(Some(count))
    }
}

/// How long output readers may outlive the tool when the timeout budget is already spent.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Waits for the output readers until `until`, then detaches what is still open.
/// Lines already read stay in the sink.
async fn drain_readers(readers: Vec<JoinHandle<()>>, until: Instant) {
    for mut reader in readers {
        match tokio::time::timeout_at(until, &mut reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("tool output reader ended abnormally: {}", e),
            Err(_) => {
                debug!("tool output still open after exit, dropping the rest");
                reader.abort();
            }
        }
    }
}

async fn pump_lines<R>(reader: R, sink: Shared<Vec<String>>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if is_stderr {
                    warn!(target: "cfopt_kernel::tool", "{}", line);
                } else {
                    debug!(target: "cfopt_kernel::tool", "{}", line);
                }
                sink.lock().push(line);
            }
        }
    }
}

fn log_diagnostics(d: &ParseDiagnostics) {
    if d.missing_ip_column {
        warn!("result file has no IP column");
    }
    if d.dropped_rows > 0 {
        warn!(dropped = d.dropped_rows, "short rows dropped from result file");
    }
    if !d.unrecognized_headers.is_empty() {
        debug!(headers = ?d.unrecognized_headers, "unrecognized result columns kept as extra");
    }
}
