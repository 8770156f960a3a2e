/*!
Test harness for the cfopt kernel

Wires a real `Optimizer` to:
- a fake speed-test tool installed in a temp work dir
- an in-memory remote device for propagation
- a guard that can be forced into contention
- a scripted reachability probe for heartbeat scenarios
*/

use crate::fake_tool::FakeSpeedTest;
use crate::mock_remote::{MockConnector, MockRemoteStore};
use anyhow::Result;
use async_trait::async_trait;
use cfopt_kernel::config::{PropagationTarget, SpeedTestConf, TargetFormat};
use cfopt_kernel::guard::{AtomicRunGuard, ExecutionGuard};
use cfopt_kernel::heartbeat::{Heartbeat, ProbeError, ReachabilityProbe};
use cfopt_kernel::optimizer::Optimizer;
use cfopt_kernel::propagation::Propagator;
use cfopt_kernel::state::SharedOptimizationState;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Installs a test-writer subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("cfopt_kernel=debug"))
        .with_test_writer()
        .try_init()
        .ok();
}

/// Atomic guard that can be pinned "held" to simulate a run in flight.
#[derive(Debug, Default)]
pub struct ContendedGuard {
    inner: AtomicRunGuard,
    forced: AtomicBool,
    acquired: AtomicUsize,
    refused: AtomicUsize,
}

impl ContendedGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_held(&self, held: bool) {
        self.forced.store(held, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }
}

impl ExecutionGuard for ContendedGuard {
    fn try_acquire(&self) -> bool {
        if !self.forced.load(Ordering::SeqCst) && self.inner.try_acquire() {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            self.refused.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    fn release(&self) {
        self.inner.release();
    }

    fn is_held(&self) -> bool {
        self.forced.load(Ordering::SeqCst) || self.inner.is_held()
    }
}

/// Probe answering from a script; once the script runs out it repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<Option<bool>>>,
    fallback: Option<bool>,
    probed: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    /// Always answers `reachable`.
    pub fn always(reachable: bool) -> Self {
        Self::scripted(Vec::new(), Some(reachable))
    }

    /// Always fails to execute, like a host without `ping`.
    pub fn broken() -> Self {
        Self::scripted(Vec::new(), None)
    }

    /// `None` entries fail to execute.
    pub fn scripted(answers: Vec<Option<bool>>, fallback: Option<bool>) -> Self {
        Self { answers: Mutex::new(answers.into()), fallback, probed: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> usize {
        self.probed.lock().unwrap().len()
    }

    pub fn probed_ips(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self, ip: &str) -> Result<bool, ProbeError> {
        self.probed.lock().unwrap().push(ip.to_string());
        let answer = self.answers.lock().unwrap().pop_front().unwrap_or(self.fallback);
        answer.ok_or_else(|| ProbeError::Exec(std::io::Error::new(std::io::ErrorKind::NotFound, "ping: not found")))
    }
}

/// A real optimizer over a temp work dir, a fake tool and mock devices.
pub struct TestHarness {
    pub dir: TempDir,
    pub state: SharedOptimizationState,
    pub guard: Arc<ContendedGuard>,
    pub remote: MockRemoteStore,
    pub connector: MockConnector,
    pub optimizer: Arc<Optimizer>,
}

impl TestHarness {
    /// No propagation targets.
    #[cfg(unix)]
    pub fn new(tool: &FakeSpeedTest) -> Result<Self> {
        Self::build(tool, Vec::new(), MockConnector::new(MockRemoteStore::new()))
    }

    /// Propagates to `targets`, all served by `remote`.
    #[cfg(unix)]
    pub fn with_targets(tool: &FakeSpeedTest, targets: Vec<PropagationTarget>, remote: MockRemoteStore) -> Result<Self> {
        Self::build(tool, targets, MockConnector::new(remote))
    }

    /// Propagates to `targets` through a connector that refuses every connection.
    #[cfg(unix)]
    pub fn with_unreachable_targets(tool: &FakeSpeedTest, targets: Vec<PropagationTarget>) -> Result<Self> {
        Self::build(tool, targets, MockConnector::unreachable())
    }

    /// Propagates to `targets` through a caller-supplied connector.
    #[cfg(unix)]
    pub fn with_connector(tool: &FakeSpeedTest, targets: Vec<PropagationTarget>, connector: MockConnector) -> Result<Self> {
        Self::build(tool, targets, connector)
    }

    #[cfg(unix)]
    fn build(tool: &FakeSpeedTest, targets: Vec<PropagationTarget>, connector: MockConnector) -> Result<Self> {
        init_test_logging();
        let dir = tempfile::tempdir()?;
        let binary = tool.install(dir.path())?;
        let conf = SpeedTestConf { binary, work_dir: dir.path().to_path_buf(), timeout_seconds: 30, ..Default::default() };

        let state = SharedOptimizationState::new();
        let guard = Arc::new(ContendedGuard::new());
        let dyn_guard: Arc<dyn ExecutionGuard> = guard.clone();
        let remote = connector.store();
        let propagator = Propagator::new(Arc::new(connector.clone()), targets);
        let optimizer = Arc::new(Optimizer::new(conf, state.clone(), dyn_guard, Some(propagator)));

        Ok(Self { dir, state, guard, remote, connector, optimizer })
    }

    /// Swaps the tool in place; the optimizer picks it up on its next run.
    #[cfg(unix)]
    pub fn replace_tool(&self, tool: &FakeSpeedTest) -> Result<()> {
        tool.install(self.dir.path())?;
        Ok(())
    }

    pub fn heartbeat(&self, probe: Arc<ScriptedProbe>) -> Heartbeat {
        Heartbeat::new(self.optimizer.clone(), probe)
    }

    pub fn hosts_target(name: &str, remote_path: &str) -> PropagationTarget {
        Self::target(name, remote_path, TargetFormat::HostsBlock)
    }

    pub fn rewrite_target(name: &str, remote_path: &str) -> PropagationTarget {
        Self::target(name, remote_path, TargetFormat::RewriteList)
    }

    fn target(name: &str, remote_path: &str, format: TargetFormat) -> PropagationTarget {
        PropagationTarget {
            name: name.to_string(),
            enabled: true,
            host: "192.168.1.1".to_string(),
            port: 22,
            username: "root".to_string(),
            password: Some("secret".to_string()),
            private_key: None,
            passphrase: None,
            remote_path: remote_path.to_string(),
            format,
            post_update_command: Some(format!("reload {name}")),
            timeout_seconds: 5,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use cfopt_kernel::heartbeat::HeartbeatOutcome;
    use cfopt_kernel::optimizer::{RunError, RunOutcome};
    use cfopt_kernel::propagation::hosts::{END_MARKER, START_MARKER};
    use cfopt_kernel::propagation::PropagationStatus;
    use cfopt_kernel::scheduler::{startup_check, StartupCheck};
    use std::time::{Duration, Instant};

    const CSV: &str = "IP 地址,平均延迟,丢包率,下载速度\n1.1.1.1,20,0.01,15\n";

    fn hosts_file() -> String {
        format!("127.0.0.1 localhost\n{START_MARKER}\ncdn.example.com 9.9.9.9\n{END_MARKER}\n")
    }

    const ADGUARD: &str = "filtering:\n  rewrites:\n    - domain: cdn.example.com\n      answer: 9.9.9.9\n";

    #[tokio::test]
    async fn test_successful_run_sets_best_ip() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        let outcome = h.optimizer.run_once().await;
        assert!(matches!(outcome, RunOutcome::Succeeded(_)));
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
        assert_eq!(h.state.last_results().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_keeps_previous_state() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        h.optimizer.run_once().await;
        let before = h.state.snapshot();

        h.replace_tool(&FakeSpeedTest::failing(1)).unwrap();
        let outcome = h.optimizer.run_once().await;
        assert!(matches!(outcome, RunOutcome::Failed { error: RunError::NonZeroExit { code: 1 }, .. }));
        let after = h.state.snapshot();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.best_ip, before.best_ip);
        assert!(!h.guard.is_held());
    }

    #[tokio::test]
    async fn test_simultaneous_runs_admit_exactly_one() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV).with_delay(1)).unwrap();
        let (a, b) = tokio::join!(
            tokio::spawn({
                let o = h.optimizer.clone();
                async move { o.run_once().await }
            }),
            tokio::spawn({
                let o = h.optimizer.clone();
                async move { o.run_once().await }
            }),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| !o.is_skipped()).count(), 1);
        assert_eq!(h.guard.acquired(), 1);
        assert_eq!(h.state.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn test_contended_guard_skips_without_running() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        h.guard.force_held(true);
        assert!(h.optimizer.run_once().await.is_skipped());
        assert_eq!(h.guard.refused(), 1);
        assert_eq!(h.state.snapshot().generation, 0);
        assert!(!h.dir.path().join("result.csv").exists());
    }

    #[tokio::test]
    async fn test_heartbeat_without_best_ip_does_nothing() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        let probe = Arc::new(ScriptedProbe::always(false));
        let outcome = h.heartbeat(probe.clone()).check_reachability().await;
        assert!(matches!(outcome, HeartbeatOutcome::NoBestIp));
        assert_eq!(probe.calls(), 0);
        assert_eq!(h.guard.acquired(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_reruns() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding("IP 地址,平均延迟\n8.8.8.8,90\n")).unwrap();
        h.optimizer.run_once().await;
        h.replace_tool(&FakeSpeedTest::succeeding(CSV)).unwrap();

        let probe = Arc::new(ScriptedProbe::always(false));
        let outcome = h.heartbeat(probe.clone()).check_reachability().await;
        assert!(matches!(outcome, HeartbeatOutcome::Unreachable(RunOutcome::Succeeded(_))));
        assert_eq!(probe.probed_ips(), vec!["8.8.8.8".to_string()]);
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_broken_probe_never_runs() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        h.optimizer.run_once().await;
        let probe = Arc::new(ScriptedProbe::broken());
        let outcome = h.heartbeat(probe).check_reachability().await;
        assert!(matches!(outcome, HeartbeatOutcome::ProbeError(_)));
        assert_eq!(h.guard.acquired(), 1);
    }

    #[tokio::test]
    async fn test_propagation_is_idempotent() {
        let remote = MockRemoteStore::new()
            .with_file("/etc/hosts", &hosts_file())
            .with_file("/opt/AdGuardHome/AdGuardHome.yaml", ADGUARD);
        let targets = vec![
            TestHarness::hosts_target("openwrt", "/etc/hosts"),
            TestHarness::rewrite_target("adguard", "/opt/AdGuardHome/AdGuardHome.yaml"),
        ];
        let h = TestHarness::with_targets(&FakeSpeedTest::succeeding(CSV), targets, remote).unwrap();

        let RunOutcome::Succeeded(run) = h.optimizer.run_once().await else { panic!("run failed") };
        assert!(run.propagation.iter().all(|r| r.status == PropagationStatus::Updated));
        assert!(h.remote.file("/etc/hosts").unwrap().contains("cdn.example.com 1.1.1.1"));
        assert!(h.remote.file("/opt/AdGuardHome/AdGuardHome.yaml").unwrap().contains("answer: 1.1.1.1"));
        assert_eq!(h.remote.write_count(), 2);
        assert_eq!(h.remote.commands().len(), 2);

        let RunOutcome::Succeeded(again) = h.optimizer.run_once().await else { panic!("run failed") };
        assert!(again.propagation.iter().all(|r| r.status == PropagationStatus::Unchanged));
        assert_eq!(h.remote.write_count(), 2);
        assert_eq!(h.remote.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_propagation_failure_keeps_new_state() {
        let targets = vec![TestHarness::hosts_target("openwrt", "/etc/hosts")];
        let h = TestHarness::with_unreachable_targets(&FakeSpeedTest::succeeding(CSV), targets).unwrap();

        let RunOutcome::Succeeded(run) = h.optimizer.run_once().await else { panic!("run failed") };
        assert!(matches!(&run.propagation[0].status, PropagationStatus::Failed { .. }));
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
        assert_eq!(h.connector.connections(), vec!["openwrt".to_string()]);
        assert!(!h.guard.is_held());
    }

    #[tokio::test]
    async fn test_empty_result_skips_propagation() {
        let remote = MockRemoteStore::new().with_file("/etc/hosts", &hosts_file());
        let targets = vec![TestHarness::hosts_target("openwrt", "/etc/hosts")];
        let h = TestHarness::with_targets(&FakeSpeedTest::succeeding("IP 地址,平均延迟\n"), targets, remote).unwrap();

        let RunOutcome::Succeeded(run) = h.optimizer.run_once().await else { panic!("run failed") };
        assert!(run.records.is_empty());
        assert!(run.propagation.is_empty());
        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_hung_target_times_out_and_releases_guard() {
        let remote = MockRemoteStore::new().with_file("/etc/hosts", &hosts_file());
        let mut target = TestHarness::hosts_target("openwrt", "/etc/hosts");
        target.timeout_seconds = 1;
        let connector = MockConnector::hanging(remote, Duration::from_secs(6));
        let h = TestHarness::with_connector(&FakeSpeedTest::succeeding(CSV), vec![target], connector).unwrap();

        let started = Instant::now();
        let RunOutcome::Succeeded(run) = h.optimizer.run_once().await else { panic!("run failed") };
        assert!(started.elapsed() < Duration::from_secs(6));
        assert!(matches!(&run.propagation[0].status, PropagationStatus::Failed { error } if error.contains("did not finish")));
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
        assert!(!h.optimizer.is_running());
        assert_eq!(h.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_startup_restores_and_checks_previous_results() {
        let h = TestHarness::new(&FakeSpeedTest::failing(1)).unwrap();
        std::fs::write(h.dir.path().join("result.csv"), CSV).unwrap();
        let probe = Arc::new(ScriptedProbe::always(true));
        let hb = Arc::new(h.heartbeat(probe.clone()));

        let check = startup_check(h.optimizer.clone(), Some(hb), true).await;
        assert!(matches!(check, StartupCheck::Restored(Some(HeartbeatOutcome::Reachable))));
        assert_eq!(probe.probed_ips(), vec!["1.1.1.1".to_string()]);
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_startup_runs_when_previous_results_are_empty() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        std::fs::write(h.dir.path().join("result.csv"), "IP 地址,平均延迟\n").unwrap();
        let probe = Arc::new(ScriptedProbe::always(true));
        let hb = Arc::new(h.heartbeat(probe.clone()));

        let check = startup_check(h.optimizer.clone(), Some(hb), true).await;
        assert!(matches!(check, StartupCheck::Ran(RunOutcome::Succeeded(_))));
        assert_eq!(probe.calls(), 0);
        assert_eq!(h.state.best_ip().as_deref(), Some("1.1.1.1"));
    }

    #[tokio::test]
    async fn test_startup_waits_when_run_on_startup_is_off() {
        let h = TestHarness::new(&FakeSpeedTest::succeeding(CSV)).unwrap();
        let check = startup_check(h.optimizer.clone(), None, false).await;
        assert!(matches!(check, StartupCheck::Idle));
        assert_eq!(h.guard.acquired(), 1);
        assert_eq!(h.state.best_ip(), None);
    }
}
