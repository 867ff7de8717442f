//! Process-wide workflow orchestrator (§4.8).
//!
//! Owns the two periodic sweeps (memory synthesis, dream curation) plus a
//! stale-dream-session janitor, all driven by [`tokio_cron_scheduler`]. Each
//! workflow keeps its own in-process set of currently-running anima ids
//! ([`RunningGuard`]) so a slow cycle for one anima never overlaps a second
//! one for the same anima — the database-level check in
//! [`ltam_core::dream::start_session`] and [`ltam_core::synthesis`]'s
//! idempotent threshold gate back this up across process restarts, but the
//! in-process guard is what avoids two overlapping tokio tasks fighting
//! over the same rows.
//!
//! `ltam-scheduler`'s `main.rs` is the composition root that supplies real
//! [`ltam_core::collaborators::Collaborators`] (see [`clients`]) and calls
//! [`run_scheduler_service`].

pub mod clients;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use ltam_core::collaborators::Collaborators;
use ltam_core::dream::{self, DreamConfig};
use ltam_core::entities::{Anima, DreamSession, DreamStatus, DreamTrigger};
use ltam_core::error::Result as CoreResult;
use ltam_core::ids::AnimaId;
use ltam_core::store::Store;
use ltam_core::synthesis::{self, SynthesisOutcome, SynthesisThresholds};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Cumulative counters for one workflow (synthesis or dream), surfaced by
/// [`SchedulerContext::synthesis_status`]/[`SchedulerContext::dream_status`]
/// per §4.8's uniform status report.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WorkflowStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub animas_processed: u64,
    pub items_created: u64,
}

#[derive(Debug, Clone, Default)]
struct WorkflowTracker {
    stats: WorkflowStats,
    last_run: Option<DateTime<Utc>>,
}

impl WorkflowTracker {
    fn record_sweep(&mut self, report: &SweepReport, items_created: u64) {
        self.last_run = Some(Utc::now());
        self.stats.total_runs += 1;
        self.stats.animas_processed += (report.animas_considered - report.animas_skipped_already_running) as u64;
        self.stats.items_created += items_created;
        if report.errors.is_empty() {
            self.stats.successful_runs += 1;
        } else {
            self.stats.failed_runs += 1;
        }
    }
}

/// The uniform status shape §4.8 asks for: `{running, interval_hours,
/// last_run, next_run, stats}`. `next_run` is `last_run + interval_hours`
/// when a sweep has run at least once; the service always schedules the
/// same fixed-interval job, so that arithmetic is exact, not an estimate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowStatus {
    pub running: bool,
    pub interval_hours: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub stats: WorkflowStats,
}

/// Cron expressions and thresholds governing the scheduler's periodic
/// sweeps. Fields are seconds-first five/six-field cron strings, per
/// `tokio-cron-scheduler`'s `Job::new_async` convention.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub synthesis_sweep_cron: String,
    pub dream_sweep_cron: String,
    pub stale_session_sweep_cron: String,
    /// Must describe the same cadence as `synthesis_sweep_cron`; kept as a
    /// plain number rather than derived from the cron string so the status
    /// report (§4.8) doesn't need a cron-arithmetic dependency.
    pub synthesis_interval_hours: f64,
    /// Must describe the same cadence as `dream_sweep_cron`.
    pub dream_interval_hours: f64,
    pub synthesis_thresholds: SynthesisThresholds,
    pub dream_config: DreamConfig,
    /// Debounce window for [`enqueue_realtime_synthesis`]: a burst of
    /// events for the same anima within this window collapses to one
    /// scheduled run.
    pub realtime_debounce: StdDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            synthesis_sweep_cron: "0 */5 * * * *".to_string(),
            dream_sweep_cron: "0 0 3 * * *".to_string(),
            stale_session_sweep_cron: "0 */15 * * * *".to_string(),
            synthesis_interval_hours: 5.0 / 60.0,
            dream_interval_hours: 24.0,
            synthesis_thresholds: SynthesisThresholds::default(),
            dream_config: DreamConfig::default(),
            realtime_debounce: StdDuration::from_secs(30),
        }
    }
}

/// Tracks which animas a given workflow is currently running for, so a
/// second invocation for the same anima (from the periodic sweep, a manual
/// trigger, or a debounced realtime enqueue) is skipped rather than
/// started concurrently.
#[derive(Default)]
pub struct RunningGuard {
    running: Mutex<HashSet<AnimaId>>,
}

impl RunningGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and marks `anima_id` running if it wasn't already.
    async fn try_enter(&self, anima_id: AnimaId) -> bool {
        self.running.lock().await.insert(anima_id)
    }

    async fn leave(&self, anima_id: AnimaId) {
        self.running.lock().await.remove(&anima_id);
    }

    pub async fn is_running(&self, anima_id: AnimaId) -> bool {
        self.running.lock().await.contains(&anima_id)
    }
}

/// What a sweep of all animas did, surfaced for status reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepReport {
    pub animas_considered: usize,
    pub animas_skipped_already_running: usize,
    pub outcomes: Vec<String>,
    pub errors: Vec<String>,
}

/// Shared handles a running scheduler service passes to every job closure.
/// Constructed once in `main.rs` and cloned (cheaply, via the inner `Arc`s)
/// into each cron job.
#[derive(Clone)]
pub struct SchedulerContext {
    pub store: Arc<Store>,
    pub collaborators: Arc<Collaborators>,
    pub config: Arc<SchedulerConfig>,
    pub synthesis_guard: Arc<RunningGuard>,
    pub dream_guard: Arc<RunningGuard>,
    debounced: Arc<Mutex<HashMap<AnimaId, tokio::time::Instant>>>,
    synthesis_tracker: Arc<Mutex<WorkflowTracker>>,
    dream_tracker: Arc<Mutex<WorkflowTracker>>,
    started: Arc<std::sync::atomic::AtomicBool>,
}

impl SchedulerContext {
    pub fn new(store: Arc<Store>, collaborators: Arc<Collaborators>, config: SchedulerConfig) -> Self {
        Self {
            store,
            collaborators,
            config: Arc::new(config),
            synthesis_guard: Arc::new(RunningGuard::new()),
            dream_guard: Arc::new(RunningGuard::new()),
            debounced: Arc::new(Mutex::new(HashMap::new())),
            synthesis_tracker: Arc::new(Mutex::new(WorkflowTracker::default())),
            dream_tracker: Arc::new(Mutex::new(WorkflowTracker::default())),
            started: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// `{running, interval_hours, last_run, next_run, stats}` for the
    /// memory-synthesis workflow (§4.8).
    pub async fn synthesis_status(&self) -> WorkflowStatus {
        let tracker = self.synthesis_tracker.lock().await;
        self.status_from(tracker.clone(), self.config.synthesis_interval_hours)
    }

    /// Same shape for the dream-curation workflow.
    pub async fn dream_status(&self) -> WorkflowStatus {
        let tracker = self.dream_tracker.lock().await;
        self.status_from(tracker.clone(), self.config.dream_interval_hours)
    }

    fn status_from(&self, tracker: WorkflowTracker, interval_hours: f64) -> WorkflowStatus {
        let next_run = tracker
            .last_run
            .map(|t| t + chrono::Duration::milliseconds((interval_hours * 3_600_000.0) as i64));
        WorkflowStatus {
            running: self.started.load(std::sync::atomic::Ordering::SeqCst),
            interval_hours,
            last_run: tracker.last_run,
            next_run,
            stats: tracker.stats,
        }
    }
}

/// One synthesis attempt for `anima_id` on behalf of `user_id`, guarded by
/// `guard` so a sweep and a manual/debounced trigger never overlap for the
/// same anima. `user_id` is forwarded as-is to [`synthesis::run_synthesis`],
/// which owns the actual ownership check — a caller-supplied id that
/// doesn't own `anima_id` fails there, it is never silently substituted
/// with the anima's real owner.
async fn run_synthesis_guarded(
    ctx: &SchedulerContext,
    user_id: ltam_core::ids::UserId,
    anima_id: AnimaId,
) -> Option<CoreResult<SynthesisOutcome>> {
    if !ctx.synthesis_guard.try_enter(anima_id).await {
        return None;
    }
    let result = synthesis::run_synthesis(&ctx.store, &ctx.collaborators, user_id, anima_id, &ctx.config.synthesis_thresholds).await;
    ctx.synthesis_guard.leave(anima_id).await;
    Some(result)
}

/// One dream cycle for `anima_id` on behalf of `user_id`, guarded by
/// `guard`. Starting the session (and thus the durable
/// `has_running_dream_session` check) happens inside the guarded section so
/// a crash between the in-process guard and the database insert can't
/// leave the guard held with nothing to show for it.
async fn run_dream_guarded(
    ctx: &SchedulerContext,
    user_id: ltam_core::ids::UserId,
    anima_id: AnimaId,
    trigger: DreamTrigger,
    triggered_by_user_id: Option<ltam_core::ids::UserId>,
) -> Option<CoreResult<DreamSession>> {
    if !ctx.dream_guard.try_enter(anima_id).await {
        return None;
    }
    let result = run_dream_cycle(ctx, user_id, anima_id, trigger, triggered_by_user_id).await;
    ctx.dream_guard.leave(anima_id).await;
    Some(result)
}

async fn run_dream_cycle(
    ctx: &SchedulerContext,
    user_id: ltam_core::ids::UserId,
    anima_id: AnimaId,
    trigger: DreamTrigger,
    triggered_by_user_id: Option<ltam_core::ids::UserId>,
) -> CoreResult<DreamSession> {
    let session = dream::start_session(&ctx.store, user_id, anima_id, trigger, triggered_by_user_id)?;
    dream::run_dream(&ctx.store, &ctx.collaborators, user_id, anima_id, session, ctx.config.dream_config).await
}

/// Sweeps every active anima, running a synthesis attempt for each one not
/// already running. Skipped/errored animas don't block the rest of the
/// sweep.
pub async fn sweep_synthesis(ctx: &SchedulerContext) -> CoreResult<SweepReport> {
    let animas = ctx.store.list_active_animas()?;
    let mut report = SweepReport {
        animas_considered: animas.len(),
        ..Default::default()
    };
    let mut items_created = 0u64;

    for anima in &animas {
        match run_synthesis_guarded(ctx, anima.user_id, anima.id).await {
            None => report.animas_skipped_already_running += 1,
            Some(Ok(outcome)) => {
                if matches!(outcome, SynthesisOutcome::Synthesized { .. }) {
                    items_created += 1;
                }
                report.outcomes.push(format!("{}: {:?}", anima.id, outcome));
            }
            Some(Err(err)) => {
                tracing::warn!(anima = %anima.id, error = %err, "synthesis sweep failed for anima");
                report.errors.push(format!("{}: {err}", anima.id));
            }
        }
    }
    ctx.synthesis_tracker.lock().await.record_sweep(&report, items_created);
    Ok(report)
}

/// Sweeps every active anima, running a dream cycle for each one not
/// already running (and not already dreaming today, per
/// [`ltam_core::store::Store::most_recent_completed_dream`] inside the
/// curation engine's own gather phase — this sweep itself is unconditional,
/// relying on the engine to decide whether the cycle does anything).
pub async fn sweep_dreams(ctx: &SchedulerContext) -> CoreResult<SweepReport> {
    let animas = ctx.store.list_active_animas()?;
    let mut report = SweepReport {
        animas_considered: animas.len(),
        ..Default::default()
    };
    let mut items_created = 0u64;

    for anima in &animas {
        match run_dream_guarded(ctx, anima.user_id, anima.id, DreamTrigger::Scheduled, None).await {
            None => report.animas_skipped_already_running += 1,
            Some(Ok(session)) => {
                if session.status == DreamStatus::Completed {
                    items_created += session.memories_created as u64;
                }
                report.outcomes.push(format!("{}: {:?}", anima.id, session.status));
            }
            Some(Err(err)) => {
                tracing::warn!(anima = %anima.id, error = %err, "dream sweep failed for anima");
                report.errors.push(format!("{}: {err}", anima.id));
            }
        }
    }
    ctx.dream_tracker.lock().await.record_sweep(&report, items_created);
    Ok(report)
}

/// Marks abandoned `RUNNING` dream sessions `FAILED` (§4.7, §5). Returns
/// the number of sessions swept.
pub async fn sweep_stale_dream_sessions(ctx: &SchedulerContext) -> CoreResult<u64> {
    dream::sweep_stale_sessions(&ctx.store)
}

/// Schedules a debounced, on-demand synthesis run for `anima_id`: if
/// another enqueue for the same anima lands within
/// `config.realtime_debounce`, this call is a no-op — the already-scheduled
/// run will pick up everything accumulated by then anyway, since synthesis
/// always collects events since the last checkpoint rather than since the
/// triggering event.
pub async fn enqueue_realtime_synthesis(ctx: SchedulerContext, anima: Anima) {
    let now = tokio::time::Instant::now();
    {
        let mut debounced = ctx.debounced.lock().await;
        if let Some(last) = debounced.get(&anima.id) {
            if now.duration_since(*last) < ctx.config.realtime_debounce {
                return;
            }
        }
        debounced.insert(anima.id, now);
    }

    let debounce = ctx.config.realtime_debounce;
    let user_id = anima.user_id;
    let anima_id = anima.id;
    tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        match run_synthesis_guarded(&ctx, user_id, anima_id).await {
            None => tracing::debug!(anima = %anima_id, "realtime synthesis skipped: already running"),
            Some(Ok(outcome)) => tracing::debug!(anima = %anima_id, outcome = ?outcome, "realtime synthesis completed"),
            Some(Err(err)) => tracing::warn!(anima = %anima_id, error = %err, "realtime synthesis failed"),
        }
    });
}

/// Triggers an immediate synthesis run for `anima_id` on behalf of
/// `user_id`, bypassing the scheduled sweep but still honoring
/// [`RunningGuard`]. Returns `Ok(None)` if a run for this anima is already
/// in flight rather than erroring — callers (the CLI, an admin endpoint)
/// can present that as a 409. A `user_id` that doesn't own `anima_id`
/// surfaces as [`ltam_core::error::CoreError::NotFound`] from
/// [`synthesis::run_synthesis`]'s own tenancy check, not as a bypass.
pub async fn trigger_synthesis_now(ctx: &SchedulerContext, user_id: ltam_core::ids::UserId, anima_id: AnimaId) -> CoreResult<Option<SynthesisOutcome>> {
    match run_synthesis_guarded(ctx, user_id, anima_id).await {
        None => Ok(None),
        Some(result) => result.map(Some),
    }
}

/// Triggers an immediate dream cycle for `anima_id` on behalf of
/// `user_id`. Same `None`-means-busy convention, and the same
/// tenancy-check-lives-downstream property, as [`trigger_synthesis_now`].
pub async fn trigger_dream_now(ctx: &SchedulerContext, user_id: ltam_core::ids::UserId, anima_id: AnimaId) -> CoreResult<Option<DreamSession>> {
    match run_dream_guarded(ctx, user_id, anima_id, DreamTrigger::Manual, Some(user_id)).await {
        None => Ok(None),
        Some(result) => result.map(Some),
    }
}

/// The workflow names `trigger_manual` dispatches between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowName {
    MemorySynthesis,
    DreamCuration,
}

/// What a manual trigger did: the per-anima outcome when `anima_id` was
/// given, or a fan-out sweep report when it wasn't.
#[derive(Debug)]
pub enum ManualTriggerResult {
    Synthesis(Option<SynthesisOutcome>),
    Dream(Option<DreamSession>),
    Sweep(SweepReport),
}

/// `trigger_manual(workflow, anima_id?)` (§4.8): with `anima_id`, dispatches
/// to the single-anima entry point for `workflow` (still subject to its
/// [`RunningGuard`]); without one, fans out across every active anima via
/// the same sweep a scheduled tick would run.
pub async fn trigger_manual(
    ctx: &SchedulerContext,
    workflow: WorkflowName,
    user_id: ltam_core::ids::UserId,
    anima_id: Option<AnimaId>,
) -> CoreResult<ManualTriggerResult> {
    match (workflow, anima_id) {
        (WorkflowName::MemorySynthesis, Some(anima_id)) => {
            trigger_synthesis_now(ctx, user_id, anima_id).await.map(ManualTriggerResult::Synthesis)
        }
        (WorkflowName::MemorySynthesis, None) => sweep_synthesis(ctx).await.map(ManualTriggerResult::Sweep),
        (WorkflowName::DreamCuration, Some(anima_id)) => {
            trigger_dream_now(ctx, user_id, anima_id).await.map(ManualTriggerResult::Dream)
        }
        (WorkflowName::DreamCuration, None) => sweep_dreams(ctx).await.map(ManualTriggerResult::Sweep),
    }
}

/// Builds and starts the three periodic jobs, then returns the running
/// [`JobScheduler`] handle. The caller (`main.rs`) is responsible for
/// keeping the process alive and, on shutdown, calling
/// `scheduler.shutdown().await`.
pub async fn run_scheduler_service(ctx: SchedulerContext) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let synthesis_ctx = ctx.clone();
    let synthesis_job = Job::new_async(ctx.config.synthesis_sweep_cron.as_str(), move |_uuid, _lock| {
        let ctx = synthesis_ctx.clone();
        Box::pin(async move {
            match sweep_synthesis(&ctx).await {
                Ok(report) => tracing::info!(considered = report.animas_considered, skipped = report.animas_skipped_already_running, errors = report.errors.len(), "synthesis sweep complete"),
                Err(err) => tracing::error!(error = %err, "synthesis sweep failed to run"),
            }
        })
    })?;
    scheduler.add(synthesis_job).await?;

    let dream_ctx = ctx.clone();
    let dream_job = Job::new_async(ctx.config.dream_sweep_cron.as_str(), move |_uuid, _lock| {
        let ctx = dream_ctx.clone();
        Box::pin(async move {
            match sweep_dreams(&ctx).await {
                Ok(report) => tracing::info!(considered = report.animas_considered, skipped = report.animas_skipped_already_running, errors = report.errors.len(), "dream sweep complete"),
                Err(err) => tracing::error!(error = %err, "dream sweep failed to run"),
            }
        })
    })?;
    scheduler.add(dream_job).await?;

    let stale_ctx = ctx.clone();
    let stale_job = Job::new_async(ctx.config.stale_session_sweep_cron.as_str(), move |_uuid, _lock| {
        let ctx = stale_ctx.clone();
        Box::pin(async move {
            match sweep_stale_dream_sessions(&ctx).await {
                Ok(count) if count > 0 => tracing::warn!(count, "swept stale running dream sessions"),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "stale dream session sweep failed"),
            }
        })
    })?;
    scheduler.add(stale_job).await?;

    scheduler.start().await?;
    ctx.started.store(true, std::sync::atomic::Ordering::SeqCst);
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltam_core::collaborators::testing::{DeterministicEmbeddingClient, ScriptedLlmClient};
    use ltam_core::entities::Anima;
    use ltam_core::ids::{OrganizationId, UserId};

    fn test_ctx(responses: Vec<String>) -> (SchedulerContext, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let collaborators = Arc::new(Collaborators {
            embedding: Arc::new(DeterministicEmbeddingClient::default()),
            llm: Arc::new(ScriptedLlmClient::in_order(responses)),
            background_jobs_enabled: false,
        });
        let ctx = SchedulerContext::new(Arc::clone(&store), collaborators, SchedulerConfig::default());
        (ctx, store)
    }

    #[tokio::test]
    async fn sweep_synthesis_skips_quiet_animas() {
        let (ctx, store) = test_ctx(vec![]);
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "quiet");
        store.create_anima(&anima).unwrap();

        let report = sweep_synthesis(&ctx).await.unwrap();
        assert_eq!(report.animas_considered, 1);
        assert_eq!(report.animas_skipped_already_running, 0);
        assert_eq!(report.errors.len(), 0);
    }

    #[tokio::test]
    async fn running_guard_rejects_concurrent_entry_for_same_anima() {
        let guard = RunningGuard::new();
        let anima_id = AnimaId::new();
        assert!(guard.try_enter(anima_id).await);
        assert!(!guard.try_enter(anima_id).await);
        guard.leave(anima_id).await;
        assert!(guard.try_enter(anima_id).await);
    }

    #[tokio::test]
    async fn trigger_dream_now_reports_busy_as_none() {
        let (ctx, store) = test_ctx(vec![]);
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        assert!(ctx.dream_guard.try_enter(anima.id).await);
        let result = trigger_dream_now(&ctx, anima.user_id, anima.id).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn synthesis_status_tracks_runs_after_a_sweep() {
        let (ctx, store) = test_ctx(vec![]);
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let before = ctx.synthesis_status().await;
        assert_eq!(before.stats.total_runs, 0);
        assert!(before.last_run.is_none());

        sweep_synthesis(&ctx).await.unwrap();

        let after = ctx.synthesis_status().await;
        assert_eq!(after.stats.total_runs, 1);
        assert_eq!(after.stats.successful_runs, 1);
        assert_eq!(after.stats.animas_processed, 1);
        assert!(after.last_run.is_some());
        assert!(after.next_run.is_some());
    }

    #[tokio::test]
    async fn sweep_dreams_runs_and_completes_for_each_anima() {
        let (ctx, store) = test_ctx(vec![]);
        let anima = Anima::new(UserId::new(), OrganizationId::new(), "t");
        store.create_anima(&anima).unwrap();

        let report = sweep_dreams(&ctx).await.unwrap();
        assert_eq!(report.animas_considered, 1);
        assert_eq!(report.errors.len(), 0);
        assert_eq!(report.outcomes.len(), 1);
    }
}
