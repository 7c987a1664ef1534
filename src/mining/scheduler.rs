//! Nightly Scheduler
//!
//! Wakes up every `tick_interval_secs`, finds active users whose local
//! `run_hour:00` has passed since their last run, and mines them on a
//! bounded pool. Each user is `Idle` or `Running`; a running user is never
//! started twice. After [`NightlyScheduler::stop`] no new jobs start and
//! in-flight jobs run to completion.

use crate::config::SchedulerConfig;
use crate::mining::orchestrator::{JobSummary, MiningError, PatternMiner};
use crate::storage::{UserDirectory, UserProfile};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;

/// Per-user job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
}

/// Runs each active user's mining job once per local night
pub struct NightlyScheduler {
    miner: Arc<PatternMiner>,
    users: Arc<dyn UserDirectory>,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    states: Arc<RwLock<HashMap<String, JobState>>>,
    jobs: Mutex<JoinSet<Option<JobSummary>>>,
    shutdown: Arc<RwLock<bool>>,
}

impl NightlyScheduler {
    pub fn new(
        miner: Arc<PatternMiner>,
        users: Arc<dyn UserDirectory>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = config.max_concurrent_jobs.max(1);
        Self {
            miner,
            users,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            states: Arc::new(RwLock::new(HashMap::new())),
            jobs: Mutex::new(JoinSet::new()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn job_state(&self, user_id: &str) -> JobState {
        self.states
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(JobState::Idle)
    }

    /// Start the scheduler background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(scheduler.config.tick_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            tracing::info!(
                run_hour = scheduler.config.run_hour,
                max_concurrent_jobs = scheduler.config.max_concurrent_jobs,
                "Nightly scheduler started"
            );

            loop {
                interval.tick().await;

                if *scheduler.shutdown.read().await {
                    break;
                }

                scheduler.reap_finished().await;
                scheduler.run_due_jobs(Utc::now()).await;
            }
        })
    }

    /// Stop scheduling and wait for in-flight jobs
    pub async fn stop(&self) -> Vec<JobSummary> {
        *self.shutdown.write().await = true;
        tracing::info!("Nightly scheduler stopping, waiting for running jobs");
        let summaries = self.wait_for_jobs().await;
        tracing::info!(finished = summaries.len(), "Nightly scheduler stopped");
        summaries
    }

    /// Start jobs for every due user; returns how many were started
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) -> usize {
        if *self.shutdown.read().await {
            return 0;
        }

        let users = match self.users.list_active_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list users");
                return 0;
            }
        };

        let mut started = 0;
        for profile in users {
            match is_due(&profile, now, self.config.run_hour) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(user_id = %profile.user_id, error = %e, "Skipping user");
                    continue;
                }
            }

            {
                let mut states = self.states.write().await;
                if states.get(&profile.user_id) == Some(&JobState::Running) {
                    continue;
                }
                states.insert(profile.user_id.clone(), JobState::Running);
            }

            self.spawn_job(profile.user_id, now).await;
            started += 1;
        }

        if started > 0 {
            tracing::info!(started, "Scheduled nightly mining jobs");
        }
        started
    }

    async fn spawn_job(&self, user_id: String, now: DateTime<Utc>) {
        let miner = self.miner.clone();
        let semaphore = self.semaphore.clone();
        let states = self.states.clone();

        self.jobs.lock().await.spawn(async move {
            let summary = match semaphore.acquire_owned().await {
                Ok(_permit) => Some(miner.run_pattern_mining_at(&user_id, now).await),
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Job pool closed");
                    None
                }
            };
            states.write().await.insert(user_id, JobState::Idle);
            summary
        });
    }

    /// Collect summaries of jobs that already finished
    async fn reap_finished(&self) {
        let mut jobs = self.jobs.lock().await;
        while let Some(result) = jobs.try_join_next() {
            if let Err(e) = result {
                tracing::error!(error = %e, "Mining job panicked");
            }
        }
    }

    /// Wait for every spawned job and return their summaries
    pub async fn wait_for_jobs(&self) -> Vec<JobSummary> {
        let mut jobs = self.jobs.lock().await;
        let mut summaries = Vec::new();
        while let Some(result) = jobs.join_next().await {
            match result {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Mining job panicked"),
            }
        }
        summaries
    }
}

/// Whether a user's nightly job should run at `now`
pub fn is_due(profile: &UserProfile, now: DateTime<Utc>, run_hour: u32) -> Result<bool, MiningError> {
    let tz = profile
        .timezone
        .parse::<Tz>()
        .map_err(|e| MiningError::Timezone {
            timezone: profile.timezone.clone(),
            reason: e.to_string(),
        })?;

    let Some(slot) = scheduled_slot(now, tz, run_hour) else {
        return Ok(false);
    };
    Ok(profile.last_run_at.map_or(true, |last| last < slot))
}

/// The most recent local `run_hour:00` at or before `now`, in UTC
///
/// A slot inside a DST gap rolls forward to the first valid local time.
pub fn scheduled_slot(now: DateTime<Utc>, tz: Tz, run_hour: u32) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(&tz).date_naive();
    let slot = resolve_local(tz, today, run_hour)?;
    if slot <= now {
        return Some(slot);
    }
    resolve_local(tz, today.pred_opt()?, run_hour)
}

fn resolve_local(tz: Tz, date: NaiveDate, run_hour: u32) -> Option<DateTime<Utc>> {
    let start = date.and_time(NaiveTime::from_hms_opt(run_hour, 0, 0)?);
    (0..=12)
        .map(|step| start + Duration::minutes(15 * step))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .map(|t| t.with_timezone(&Utc))
}
