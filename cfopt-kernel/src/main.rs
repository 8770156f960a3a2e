/**
 * CFOPT KERNEL - entry point
 *
 * ROLE: wires config, shared state, guard, optimizer, heartbeat, cron loops
 * and the HTTP API together, then serves until Ctrl-C.
 */

use anyhow::{Context, Result};
use cfopt_kernel::config::{config_path, load_config};
use cfopt_kernel::guard::{AtomicRunGuard, ExecutionGuard};
use cfopt_kernel::heartbeat::{Heartbeat, PingProbe};
use cfopt_kernel::http::{self, AppState};
use cfopt_kernel::optimizer::Optimizer;
use cfopt_kernel::propagation::ssh::SshConnector;
use cfopt_kernel::propagation::Propagator;
use cfopt_kernel::ranges::ensure_ip_files;
use cfopt_kernel::scheduler::{startup_check, CronSchedule, Scheduler};
use cfopt_kernel::state::{new_state, SharedOptimizationState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cfopt_kernel=info")))
        .init();

    let path = config_path();
    let cfg = load_config(&path)
        .await
        .with_context(|| format!("failed to load config {}", path.display()))?;

    let written = ensure_ip_files(&cfg.speedtest).await.context("failed to prepare speed-test work dir")?;
    if !written.is_empty() {
        info!("created {} IP range file(s)", written.len());
    }

    let state = SharedOptimizationState::new();
    let guard: Arc<dyn ExecutionGuard> = Arc::new(AtomicRunGuard::new());
    let propagator = Propagator::new(Arc::new(SshConnector::new()), cfg.propagation.clone());
    let optimizer = Arc::new(Optimizer::new(cfg.speedtest.clone(), state, guard, Some(propagator)));
    let heartbeat = Arc::new(Heartbeat::new(optimizer.clone(), Arc::new(PingProbe::from_conf(&cfg.heartbeat))));

    // startup check runs beside the server so the API answers right away
    tokio::spawn(startup_check(
        optimizer.clone(),
        cfg.heartbeat.enabled.then(|| heartbeat.clone()),
        cfg.schedule.run_on_startup,
    ));

    let optimize_cron = CronSchedule::parse(&cfg.schedule.optimize_cron)?;
    let heartbeat_job = if cfg.heartbeat.enabled {
        Some((CronSchedule::parse(&cfg.schedule.heartbeat_cron)?, heartbeat.clone()))
    } else {
        None
    };
    let scheduler = Scheduler::spawn(optimize_cron, optimizer.clone(), heartbeat_job);
    info!("scheduler running {} job(s)", scheduler.job_count());

    let app = http::build_router(AppState {
        optimizer,
        api_key: cfg.api.api_key.clone(),
        config: new_state(cfg.clone()),
        config_path: path,
    });
    if cfg.api.api_key.is_none() {
        warn!("no api key configured: every /api route will answer 401");
    }

    let listener = TcpListener::bind(&cfg.api.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.api.listen))?;
    info!("listening on http://{}", cfg.api.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("http server failed")?;

    scheduler.shutdown();
    Ok(())
}
