//! The tick driver: dispatches due jobs, keeps the heartbeat, and runs the
//! slow adaptive timers (interval retuning and mood transitions).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use reverie_memory::{DurableStore, StoreResult};

use crate::context::JobContext;
use crate::jobs::{Job, JobKind, JobOutcome};

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub status: String,
    pub last_pulse: DateTime<Utc>,
    pub running_jobs: Vec<String>,
}

type Finished = (JobKind, Result<JobOutcome>);

pub struct Scheduler {
    ctx: Arc<JobContext>,
    jobs: Vec<Arc<dyn Job>>,
    running: HashMap<Id, JobKind>,
    tasks: JoinSet<Finished>,
    status_path: PathBuf,
    durable: DurableStore,
    last_retune: Instant,
    last_mood_check: Instant,
}

impl Scheduler {
    pub fn new(ctx: Arc<JobContext>, jobs: Vec<Arc<dyn Job>>, data_dir: impl Into<PathBuf>, durable: DurableStore) -> Self {
        Self {
            ctx,
            jobs,
            running: HashMap::new(),
            tasks: JoinSet::new(),
            status_path: data_dir.into().join(STATUS_FILE),
            durable,
            last_retune: Instant::now(),
            last_mood_check: Instant::now(),
        }
    }

    pub fn running(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.running.values().copied().collect();
        kinds.sort();
        kinds
    }

    /// One scheduling pass: collect finished jobs, dispatch every due job
    /// that is not already running, write the heartbeat, and fire the slow
    /// timers when they are due.  Returns the kinds dispatched.
    pub async fn tick(&mut self) -> Vec<JobKind> {
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            self.finish(joined);
        }

        let mut dispatched = Vec::new();
        for job in self.jobs.clone() {
            let kind = job.kind();
            if self.running.values().any(|running| *running == kind) {
                continue;
            }
            match self.ctx.clock.should_execute(kind) {
                Ok(true) => {
                    self.spawn(job);
                    dispatched.push(kind);
                }
                Ok(false) => {}
                Err(err) => warn!(kind = %kind, error = %err, "could not evaluate schedule"),
            }
        }

        if let Err(err) = self.pulse().await {
            warn!(error = %err, "heartbeat write failed");
        }
        self.run_timers().await;
        dispatched
    }

    /// Wait for every in-flight job to finish.
    pub async fn drain(&mut self) -> Vec<(JobKind, bool)> {
        let mut finished = Vec::new();
        while let Some(joined) = self.tasks.join_next_with_id().await {
            if let Some((kind, ok)) = self.finish(joined) {
                finished.push((kind, ok));
            }
        }
        finished
    }

    /// Tick until `shutdown` flips to `true`, then give in-flight jobs the
    /// configured grace period before aborting them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match self.ctx.auditor.audit().await {
            Ok(report) if !report.is_clean() => warn!(
                issues = report.issues_found,
                repairs = report.repairs_made,
                "startup integrity audit found problems"
            ),
            Ok(_) => info!("startup integrity audit clean"),
            Err(err) => error!(error = %err, "startup integrity audit failed"),
        }

        let config = self.ctx.clock.config().clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(config.tick_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_seconds = config.tick_seconds, jobs = self.jobs.len(), "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatched = self.tick().await;
                    if !dispatched.is_empty() {
                        info!(dispatched = ?dispatched, "jobs dispatched");
                    }
                }
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.finish(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let grace = Duration::from_secs(config.shutdown_grace_secs);
        info!(in_flight = self.tasks.len(), grace_secs = grace.as_secs(), "scheduler stopping");
        if tokio::time::timeout(grace, self.drain()).await.is_err() {
            warn!(aborted = self.tasks.len(), "grace period elapsed; aborting remaining jobs");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        self.running.clear();
        if let Err(err) = self.write_pulse("stopped").await {
            warn!(error = %err, "final heartbeat write failed");
        }
        info!("scheduler stopped");
        Ok(())
    }

    fn spawn(&mut self, job: Arc<dyn Job>) {
        let kind = job.kind();
        let ctx = Arc::clone(&self.ctx);
        let handle = self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(anyhow!("job panicked: {}", panic_message(payload.as_ref()))),
            };
            // Marked whatever the outcome, panics included, so a failing job
            // waits a full interval instead of retrying every tick.
            if let Err(err) = ctx.clock.mark_executed(kind).await {
                warn!(kind = %kind, error = %err, "could not record execution");
            }
            (kind, result)
        });
        self.running.insert(handle.id(), kind);
    }

    fn finish(&mut self, joined: Result<(Id, Finished), JoinError>) -> Option<(JobKind, bool)> {
        match joined {
            Ok((id, (kind, result))) => {
                self.running.remove(&id);
                match &result {
                    Ok(JobOutcome::Skipped(reason)) => info!(kind = %kind, reason = %reason, "job skipped"),
                    Ok(_) => info!(kind = %kind, "job finished"),
                    Err(err) => error!(kind = %kind, error = format!("{err:#}"), "job failed"),
                }
                Some((kind, result.is_ok()))
            }
            Err(err) => {
                let kind = self.running.remove(&err.id());
                error!(kind = ?kind, error = %err, "job task ended abnormally");
                kind.map(|kind| (kind, false))
            }
        }
    }

    async fn run_timers(&mut self) {
        let config = self.ctx.clock.config();
        let retune_every = Duration::from_secs(config.retune_minutes * 60);
        let mood_every = Duration::from_secs(config.mood_transition_minutes * 60);

        if self.last_retune.elapsed() >= retune_every {
            self.last_retune = Instant::now();
            if let Err(err) = self.ctx.clock.retune_intervals().await {
                warn!(error = %err, "interval retune failed");
            }
        }
        if self.last_mood_check.elapsed() >= mood_every {
            self.last_mood_check = Instant::now();
            if let Err(err) = self.ctx.clock.maybe_transition_mood().await {
                warn!(error = %err, "mood transition failed");
            }
        }
    }

    async fn pulse(&self) -> StoreResult<()> {
        self.write_pulse("alive").await
    }

    async fn write_pulse(&self, status: &str) -> StoreResult<()> {
        let pulse = Pulse {
            status: status.to_string(),
            last_pulse: Utc::now(),
            running_jobs: self.running().iter().map(|k| k.as_str().to_string()).collect(),
        };
        self.durable
            .update(&self.status_path, || None, move |current: &mut Option<Pulse>| {
                *current = Some(pulse);
                Ok(())
            })
            .await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reverie_memory::durable::read_json;
    use tempfile::TempDir;

    use super::*;
    use crate::jobs::tests::{FailingGenerator, ScriptedGenerator, context};
    use crate::jobs::{ThoughtJob, default_jobs};

    struct Counting {
        kind: JobKind,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Counting {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self, _ctx: &JobContext) -> Result<JobOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(JobOutcome::Skipped("counted".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Job for Panicking {
        fn kind(&self) -> JobKind {
            JobKind::Reflection
        }

        async fn run(&self, _ctx: &JobContext) -> Result<JobOutcome> {
            panic!("reflection blew up");
        }
    }

    fn scheduler(dir: &TempDir, ctx: JobContext, jobs: Vec<Arc<dyn Job>>) -> Scheduler {
        Scheduler::new(Arc::new(ctx), jobs, dir.path().join("data"), DurableStore::default())
    }

    #[tokio::test]
    async fn first_tick_runs_everything_once() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let mut scheduler = scheduler(&dir, ctx, default_jobs());

        let dispatched = scheduler.tick().await;
        assert_eq!(dispatched.len(), JobKind::ALL.len());
        let finished = scheduler.drain().await;
        assert_eq!(finished.len(), JobKind::ALL.len());

        let state = scheduler.ctx.clock.state_store().load().unwrap();
        for kind in JobKind::ALL {
            assert!(state.last_runs.contains_key(kind.as_str()), "{kind} not marked");
        }
        assert!(scheduler.running().is_empty());
    }

    #[tokio::test]
    async fn running_job_is_not_dispatched_twice() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let job: Arc<dyn Job> = Arc::new(Counting {
            kind: JobKind::Dream,
            runs: Arc::clone(&runs),
        });
        let mut scheduler = scheduler(&dir, ctx, vec![job]);

        assert_eq!(scheduler.tick().await, vec![JobKind::Dream]);
        assert_eq!(scheduler.running(), vec![JobKind::Dream]);
        assert!(scheduler.tick().await.is_empty());
        scheduler.drain().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.running().is_empty());
    }

    #[tokio::test]
    async fn failing_job_is_marked_and_not_retried_next_tick() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(FailingGenerator)).await;
        let mut scheduler = scheduler(&dir, ctx, vec![Arc::new(ThoughtJob::new(JobKind::Reflection))]);

        scheduler.tick().await;
        assert_eq!(scheduler.drain().await, vec![(JobKind::Reflection, false)]);
        assert!(scheduler.ctx.clock.state_store().load().unwrap().last_runs.contains_key("reflection"));
        assert!(scheduler.tick().await.is_empty());
    }

    #[tokio::test]
    async fn panicking_job_is_marked_and_not_redispatched() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let mut scheduler = scheduler(&dir, ctx, vec![Arc::new(Panicking)]);

        assert_eq!(scheduler.tick().await, vec![JobKind::Reflection]);
        assert_eq!(scheduler.drain().await, vec![(JobKind::Reflection, false)]);
        assert!(scheduler.running().is_empty());
        assert!(scheduler.ctx.clock.state_store().load().unwrap().last_runs.contains_key("reflection"));
        assert!(scheduler.tick().await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_lists_running_jobs() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let job: Arc<dyn Job> = Arc::new(Counting {
            kind: JobKind::Monologue,
            runs: Arc::new(AtomicUsize::new(0)),
        });
        let mut scheduler = scheduler(&dir, ctx, vec![job]);
        scheduler.tick().await;

        let pulse: Option<Pulse> = read_json(&dir.path().join("data").join(STATUS_FILE)).unwrap().flatten();
        let pulse = pulse.unwrap();
        assert_eq!(pulse.status, "alive");
        assert_eq!(pulse.running_jobs, vec!["monologue".to_string()]);
        scheduler.drain().await;
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Arc::new(ScriptedGenerator::new())).await;
        let job: Arc<dyn Job> = Arc::new(Counting {
            kind: JobKind::Existential,
            runs: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = scheduler(&dir, ctx, vec![job]);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let pulse: Option<Pulse> = read_json(&dir.path().join("data").join(STATUS_FILE)).unwrap().flatten();
        assert_eq!(pulse.unwrap().status, "stopped");
    }
}
