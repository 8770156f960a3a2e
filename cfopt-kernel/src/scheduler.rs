/**
 * SCHEDULER - cron-driven triggers for the optimizer and the heartbeat,
 * plus the one-shot startup check
 *
 * OPERATION:
 * - one tokio task per job, sleeping until the next local-time occurrence
 * - the job runs to completion before the next occurrence is computed, so a
 *   slow run delays its own next tick instead of stacking up
 * - overlap between different jobs is the execution guard's business, not ours
 *
 * Crontab expressions have five fields; the cron crate wants a seconds field
 * first and numbers weekdays 1-7 from Sunday, so five-field input is adapted.
 */

use crate::heartbeat::{Heartbeat, HeartbeatOutcome};
use crate::optimizer::{Optimizer, RunOutcome};
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
#[error("invalid cron expression `{expr}`: {reason}")]
pub struct CronError {
    pub expr: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Accepts crontab (5 fields) or cron-crate syntax (6-7 fields, seconds first).
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], crontab_weekdays(fields[4])),
            6 | 7 => fields.join(" "),
            n => {
                return Err(CronError { expr: expr.to_string(), reason: format!("expected 5 fields, got {n}") })
            }
        };
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError { expr: expr.to_string(), reason: e.to_string() })?;
        Ok(Self { expr: expr.to_string(), schedule })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

/// Crontab weekdays are 0-7 with Sunday as 0 and 7; the cron crate uses 1-7 from Sunday.
fn crontab_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|tok| match tok.parse::<u8>() {
                    Ok(n) => ((n % 7) + 1).to_string(),
                    Err(_) => tok.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(s) => format!("{range}/{s}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Runs `job` at every occurrence of `schedule` until the handle is aborted.
pub fn spawn_cron_job<F, Fut>(name: &'static str, schedule: CronSchedule, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!(job = name, cron = schedule.expr(), "scheduled job started");
        loop {
            let now = Local::now();
            let Some(next) = schedule.next_after(&now) else {
                warn!(job = name, "cron expression has no future occurrence, stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(job = name, next = %next, "sleeping until next occurrence");
            tokio::time::sleep(wait).await;
            job().await;
        }
    })
}

/// Handles of the running cron loops.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts the optimize loop and, when given, the heartbeat loop.
    pub fn spawn(
        optimize: CronSchedule,
        optimizer: Arc<Optimizer>,
        heartbeat: Option<(CronSchedule, Arc<Heartbeat>)>,
    ) -> Self {
        let mut handles = Vec::new();

        handles.push(spawn_cron_job("optimize", optimize, move || {
            let optimizer = optimizer.clone();
            async move {
                if let RunOutcome::Skipped = optimizer.run_once().await {
                    info!("scheduled optimization skipped: a run is already in progress");
                }
            }
        }));

        if let Some((schedule, hb)) = heartbeat {
            handles.push(spawn_cron_job("heartbeat", schedule, move || {
                let hb = hb.clone();
                async move {
                    hb.check_reachability().await;
                }
            }));
        }

        Self { handles }
    }

    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    pub fn shutdown(self) {
        for h in self.handles {
            h.abort();
        }
    }
}

#[derive(Debug)]
pub enum StartupCheck {
    /// Previous results restored; heartbeat outcome when one ran.
    Restored(Option<HeartbeatOutcome>),
    /// Nothing usable to restore, a fresh run was made.
    Ran(RunOutcome),
    /// Nothing usable to restore and `run_on_startup` is off.
    Idle,
}

/// Restores results left by an earlier process and checks them, or runs once
/// when there is no usable best IP. Meant to be spawned next to the server.
pub async fn startup_check(
    optimizer: Arc<Optimizer>,
    heartbeat: Option<Arc<Heartbeat>>,
    run_on_startup: bool,
) -> StartupCheck {
    match optimizer.load_existing_results().await {
        Ok(Some(_)) if optimizer.state().best_ip().is_some() => {
            let outcome = match heartbeat {
                Some(hb) => Some(hb.check_reachability().await),
                None => None,
            };
            return StartupCheck::Restored(outcome);
        }
        Ok(Some(_)) => warn!("startup: previous result file has no usable IP"),
        Ok(None) => info!("startup: no previous results"),
        Err(e) => warn!("startup: could not load previous results: {}", e),
    }
    if !run_on_startup {
        info!("startup: waiting for the schedule");
        return StartupCheck::Idle;
    }
    StartupCheck::Ran(optimizer.run_once().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_crontab_five_fields() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 30).unwrap();
        let next = s.next_after(&from).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
    }

    #[test]
    fn test_every_four_hours() {
        let s = CronSchedule::parse("0 */4 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let next = s.next_after(&from).unwrap();
        assert_eq!((next.hour(), next.minute()), (12, 0));
    }

    #[test]
    fn test_crontab_sunday_is_zero() {
        // 2024-05-01 is a Wednesday; next Sunday is the 5th
        let s = CronSchedule::parse("0 3 * * 0").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let next = s.next_after(&from).unwrap();
        assert_eq!((next.day(), next.hour()), (5, 3));
    }

    #[test]
    fn test_weekday_translation() {
        assert_eq!(crontab_weekdays("*"), "*");
        assert_eq!(crontab_weekdays("0"), "1");
        assert_eq!(crontab_weekdays("7"), "1");
        assert_eq!(crontab_weekdays("1-5"), "2-6");
        assert_eq!(crontab_weekdays("0,6"), "1,7");
        assert_eq!(crontab_weekdays("*/2"), "*/2");
        assert_eq!(crontab_weekdays("MON-FRI"), "MON-FRI");
    }

    #[test]
    fn test_seconds_syntax_passes_through() {
        assert!(CronSchedule::parse("*/10 * * * * *").is_ok());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronSchedule::parse("").is_err());
        assert!(CronSchedule::parse("* * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
    }

    #[tokio::test]
    async fn test_cron_job_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = spawn_cron_job("test", CronSchedule::parse("* * * * * *").unwrap(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        handle.abort();
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }
}
