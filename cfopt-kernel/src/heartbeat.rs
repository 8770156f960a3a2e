//! Reachability check of the committed best IP.
//!
//! An unreachable best IP triggers a fresh run through the same guard as
//! every other trigger; a probe that cannot run at all only logs.

use crate::config::HeartbeatConf;
use crate::optimizer::{Optimizer, RunOutcome};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("could not run probe: {0}")]
    Exec(#[from] std::io::Error),
    #[error("probe hung for more than {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `Ok(false)` means the host did not answer.
    async fn probe(&self, ip: &str) -> Result<bool, ProbeError>;
}

/// System `ping`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    count: u32,
    timeout_seconds: u32,
}

impl PingProbe {
    pub fn new(count: u32, timeout_seconds: u32) -> Self {
        Self { count: count.max(1), timeout_seconds: timeout_seconds.max(1) }
    }

    pub fn from_conf(conf: &HeartbeatConf) -> Self {
        Self::new(conf.count, conf.timeout_seconds)
    }

    pub fn args(&self, ip: &str) -> Vec<String> {
        if cfg!(windows) {
            vec![
                "-n".into(),
                self.count.to_string(),
                "-w".into(),
                (self.timeout_seconds * 1000).to_string(),
                ip.into(),
            ]
        } else {
            vec!["-c".into(), self.count.to_string(), "-W".into(), self.timeout_seconds.to_string(), ip.into()]
        }
    }

    fn outer_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.count * self.timeout_seconds) + 5)
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn probe(&self, ip: &str) -> Result<bool, ProbeError> {
        let limit = self.outer_timeout();
        let run = Command::new("ping")
            .args(self.args(ip))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(limit, run).await {
            Ok(status) => Ok(status?.success()),
            Err(_) => Err(ProbeError::TimedOut(limit)),
        }
    }
}

#[derive(Debug)]
pub enum HeartbeatOutcome {
    NoBestIp,
    Reachable,
    ProbeError(String),
    Unreachable(RunOutcome),
}

pub struct Heartbeat {
    optimizer: Arc<Optimizer>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl Heartbeat {
    pub fn new(optimizer: Arc<Optimizer>, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self { optimizer, probe }
    }

    pub async fn check_reachability(&self) -> HeartbeatOutcome {
        let Some(ip) = self.optimizer.state().best_ip() else {
            info!("heartbeat: no best IP yet, skipping");
            return HeartbeatOutcome::NoBestIp;
        };

        match self.probe.probe(&ip).await {
            Ok(true) => {
                info!(ip = %ip, "heartbeat: best IP reachable");
                HeartbeatOutcome::Reachable
            }
            Ok(false) => {
                warn!(ip = %ip, "heartbeat: best IP unreachable, starting a new run");
                let outcome = self.optimizer.run_once().await;
                if outcome.is_skipped() {
                    info!("heartbeat: a run is already in progress");
                }
                HeartbeatOutcome::Unreachable(outcome)
            }
            Err(e) => {
                error!(ip = %ip, "heartbeat probe failed: {}", e);
                HeartbeatOutcome::ProbeError(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedTestConf;
    use crate::guard::{AtomicRunGuard, ExecutionGuard};
    use crate::models::ResultRecord;
    use crate::state::SharedOptimizationState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        answer: Option<bool>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReachabilityProbe for FixedProbe {
        async fn probe(&self, _ip: &str) -> Result<bool, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .ok_or_else(|| ProbeError::Exec(std::io::Error::new(std::io::ErrorKind::NotFound, "ping")))
        }
    }

    fn setup(answer: Option<bool>, best: Option<&str>) -> (Heartbeat, Arc<FixedProbe>, Arc<dyn ExecutionGuard>) {
        let state = SharedOptimizationState::new();
        if let Some(ip) = best {
            state.commit(vec![ResultRecord { ip: ip.into(), ..Default::default() }]);
        }
        let guard: Arc<dyn ExecutionGuard> = Arc::new(AtomicRunGuard::new());
        let conf = SpeedTestConf { binary: "/nonexistent/CloudflareST".into(), ..Default::default() };
        let optimizer = Arc::new(Optimizer::new(conf, state, guard.clone(), None));
        let probe = Arc::new(FixedProbe { answer, calls: AtomicUsize::new(0) });
        (Heartbeat::new(optimizer, probe.clone()), probe, guard)
    }

    #[tokio::test]
    async fn test_no_best_ip_no_probe() {
        let (hb, probe, _) = setup(Some(false), None);
        assert!(matches!(hb.check_reachability().await, HeartbeatOutcome::NoBestIp));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reachable_does_nothing() {
        let (hb, probe, _) = setup(Some(true), Some("1.1.1.1"));
        assert!(matches!(hb.check_reachability().await, HeartbeatOutcome::Reachable));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_triggers_run() {
        let (hb, _, _) = setup(Some(false), Some("1.1.1.1"));
        match hb.check_reachability().await {
            HeartbeatOutcome::Unreachable(RunOutcome::Failed { .. }) => {}
            other => panic!("expected a failed run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_while_running_is_skipped() {
        let (hb, _, guard) = setup(Some(false), Some("1.1.1.1"));
        assert!(guard.try_acquire());
        assert!(matches!(hb.check_reachability().await, HeartbeatOutcome::Unreachable(RunOutcome::Skipped)));
        guard.release();
    }

    #[tokio::test]
    async fn test_probe_error_does_not_run() {
        let (hb, _, _) = setup(None, Some("1.1.1.1"));
        assert!(matches!(hb.check_reachability().await, HeartbeatOutcome::ProbeError(_)));
        assert!(hb.optimizer.last_report().is_none());
    }

    #[test]
    fn test_ping_args() {
        let args = PingProbe::new(3, 2).args("1.1.1.1");
        if cfg!(windows) {
            assert_eq!(args, vec!["-n", "3", "-w", "2000", "1.1.1.1"]);
        } else {
            assert_eq!(args, vec!["-c", "3", "-W", "2", "1.1.1.1"]);
        }
    }

    #[test]
    fn test_zero_values_clamped() {
        let p = PingProbe::new(0, 0);
        assert_eq!(p.outer_timeout(), Duration::from_secs(6));
    }
}
