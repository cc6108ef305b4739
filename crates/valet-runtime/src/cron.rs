//! # Cron agent runner
//!
//! Unattended agent loops triggered on a schedule. Invariants enforced here:
//!
//! - **At most one concurrent run per job.** An in-memory map from job id to
//!   cancellation handle is checked (and the entry inserted) without an
//!   intervening await; a duplicate trigger while a run is active is dropped
//!   with a logged warning, never queued, and creates no run record.
//! - **Exactly one delivery per run.** The run's shared delivery flag is
//!   claimed synchronously before any I/O; later attempts report skipped.
//! - **Observable endings.** Every run finalizes exactly one `CronRun`
//!   record and ends in a delivery — a success message or a failure
//!   notification — never silent disappearance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent_loop::{AgentLoop, LoopConfig, LoopEvent, LoopStop};
use crate::approval::AutoApprove;
use crate::context::{ExecutionScope, Notifier, ToolContext};
use crate::registry::ToolRegistry;
use crate::sub_agent::{READ_ONLY_TOOLS, SubAgentProfile, SubAgentRegistry};
use valet_channels::Channel;
use valet_core::{EventBus, EventTag, Message, Result, Role, ValetError};
use valet_llm::LlmProvider;

/// Where a job's output goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// Local desktop notification.
    Notify,
    /// A bound external channel conversation.
    Channel { channel_id: String, chat_id: String },
}

/// A scheduled job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub label: String,
    /// Cron expression, e.g. "0 0 8 * * *".
    pub schedule: String,
    /// The prompt handed to the agent when the job fires.
    pub prompt: String,
    /// Agent profile id; `None` falls back to the configured default.
    pub agent_profile: Option<String>,
    pub delivery: DeliveryTarget,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_fired: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronRunStatus {
    Running,
    Success,
    Error,
    Aborted,
}

/// One execution of a job. Created at run start, finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: CronRunStatus,
    pub tool_call_count: u32,
    pub output_summary: String,
    pub error: Option<String>,
}

impl CronRun {
    fn start(job_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            started_at: Utc::now(),
            finished_at: None,
            status: CronRunStatus::Running,
            tool_call_count: 0,
            output_summary: String::new(),
            error: None,
        }
    }
}

/// Lifecycle events carrying job id + run id for correlation.
#[derive(Debug, Clone)]
pub enum CronEvent {
    Started {
        job_id: Uuid,
        run_id: Uuid,
    },
    Progress {
        job_id: Uuid,
        run_id: Uuid,
        iteration: u32,
    },
    Finished {
        job_id: Uuid,
        run_id: Uuid,
        status: CronRunStatus,
    },
}

/// In-memory job/run store behind the minimal CRUD contract. The storage
/// engine itself is not part of this core.
#[derive(Default)]
pub struct CronStore {
    jobs: parking_lot::Mutex<HashMap<Uuid, CronJob>>,
    runs: parking_lot::Mutex<HashMap<Uuid, CronRun>>,
}

impl CronStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. The schedule expression is validated at registration.
    pub fn add_job(
        &self,
        label: &str,
        schedule: &str,
        prompt: &str,
        agent_profile: Option<String>,
        delivery: DeliveryTarget,
    ) -> Result<Uuid> {
        Schedule::from_str(schedule)
            .map_err(|e| ValetError::Config(format!("invalid cron expression '{schedule}': {e}")))?;
        let job = CronJob {
            id: Uuid::new_v4(),
            label: label.to_string(),
            schedule: schedule.to_string(),
            prompt: prompt.to_string(),
            agent_profile,
            delivery,
            enabled: true,
            created_at: Utc::now(),
            last_fired: None,
        };
        let id = job.id;
        self.jobs.lock().insert(id, job);
        info!(job_id = %id, label, schedule, "registered cron job");
        Ok(id)
    }

    pub fn job(&self, id: Uuid) -> Option<CronJob> {
        self.jobs.lock().get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> bool {
        match self.jobs.lock().get_mut(&id) {
            Some(job) => {
                job.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove_job(&self, id: Uuid) -> bool {
        self.jobs.lock().remove(&id).is_some()
    }

    pub fn mark_fired(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.last_fired = Some(at);
        }
    }

    fn insert_run(&self, run: CronRun) {
        self.runs.lock().insert(run.id, run);
    }

    /// Finalize a run record. A second finalize attempt is rejected so the
    /// record is written exactly once.
    fn finalize_run(
        &self,
        run_id: Uuid,
        status: CronRunStatus,
        tool_call_count: u32,
        output_summary: String,
        error: Option<String>,
    ) -> bool {
        let mut runs = self.runs.lock();
        match runs.get_mut(&run_id) {
            Some(run) if run.finished_at.is_none() => {
                run.finished_at = Some(Utc::now());
                run.status = status;
                run.tool_call_count = tool_call_count;
                run.output_summary = output_summary;
                run.error = error;
                true
            }
            Some(_) => {
                warn!(run_id = %run_id, "run already finalized — ignoring");
                false
            }
            None => false,
        }
    }

    pub fn run(&self, id: Uuid) -> Option<CronRun> {
        self.runs.lock().get(&id).cloned()
    }

    pub fn runs_for_job(&self, job_id: Uuid) -> Vec<CronRun> {
        let mut runs: Vec<CronRun> = self
            .runs
            .lock()
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

/// Truncate a run's output for the stored summary.
fn summarize(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}…")
}

/// Executes unattended runs for registered jobs.
pub struct CronAgentRunner {
    store: Arc<CronStore>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    profiles: Arc<SubAgentRegistry>,
    default_profile: String,
    base_config: LoopConfig,
    working_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    channels: parking_lot::RwLock<HashMap<String, Arc<dyn Channel>>>,
    /// job id → cancellation handle for the in-flight run.
    active: parking_lot::Mutex<HashMap<Uuid, CancellationToken>>,
    events: broadcast::Sender<CronEvent>,
    bus: EventBus,
}

impl CronAgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CronStore>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        profiles: Arc<SubAgentRegistry>,
        default_profile: &str,
        base_config: LoopConfig,
        working_dir: PathBuf,
        notifier: Arc<dyn Notifier>,
        bus: EventBus,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            provider,
            registry,
            profiles,
            default_profile: default_profile.to_string(),
            base_config,
            working_dir,
            notifier,
            channels: parking_lot::RwLock::new(HashMap::new()),
            active: parking_lot::Mutex::new(HashMap::new()),
            events,
            bus,
        }
    }

    pub fn store(&self) -> &CronStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.events.subscribe()
    }

    /// Make a channel available for channel-bound deliveries.
    pub fn register_channel(&self, channel: Arc<dyn Channel>) {
        self.channels
            .write()
            .insert(channel.id().to_string(), channel);
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.active.lock().contains_key(&job_id)
    }

    /// Cancel a job's in-flight run, if any.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.active.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Three-tier profile fallback: job's profile id → configured default
    /// profile name → minimal hardcoded profile. A run can always proceed
    /// even with incomplete configuration.
    fn resolve_profile(&self, job: &CronJob) -> Arc<SubAgentProfile> {
        if let Some(name) = &job.agent_profile {
            if let Some(profile) = self.profiles.get(name) {
                return profile;
            }
            warn!(job_id = %job.id, profile = %name, "job profile not registered — falling back");
        }
        if let Some(profile) = self.profiles.get(&self.default_profile) {
            return profile;
        }
        Arc::new(SubAgentProfile {
            name: "cron-minimal".into(),
            allowed_tools: READ_ONLY_TOOLS
                .iter()
                .map(|s| s.to_string())
                .chain(["notify".to_string(), "channel_send".to_string()])
                .collect(),
            max_iterations: 10,
            system_prompt: "You are an unattended scheduled agent. Complete the task, then \
                            deliver one concise result message with the notify tool."
                .into(),
            model: None,
            temperature: None,
        })
    }

    /// Fire one run for a job. Returns the run id, or `None` when the
    /// trigger was dropped (job disabled, or a run is already active).
    pub async fn trigger(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        let job = self
            .store
            .job(job_id)
            .ok_or(ValetError::JobNotFound(job_id))?;
        if !job.enabled {
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        // Check-and-set with no await in between: the duplicate trigger
        // window is closed before this run does any I/O.
        {
            let mut active = self.active.lock();
            if active.contains_key(&job_id) {
                warn!(job_id = %job_id, label = %job.label, "job already running — dropping duplicate trigger");
                return Ok(None);
            }
            active.insert(job_id, cancel.clone());
        }

        let run = CronRun::start(job_id);
        let run_id = run.id;
        self.store.insert_run(run);
        let _ = self.events.send(CronEvent::Started { job_id, run_id });
        info!(job_id = %job_id, run_id = %run_id, label = %job.label, "cron run started");

        let result = self.execute(&job, run_id, cancel).await;

        // Run end: release the concurrency slot and finalize exactly once.
        self.active.lock().remove(&job_id);
        let status = match &result {
            Ok((status, tool_calls, summary)) => {
                self.store
                    .finalize_run(run_id, *status, *tool_calls, summary.clone(), None);
                *status
            }
            Err(e) => {
                self.store.finalize_run(
                    run_id,
                    CronRunStatus::Error,
                    0,
                    String::new(),
                    Some(e.to_string()),
                );
                CronRunStatus::Error
            }
        };
        let _ = self.events.send(CronEvent::Finished {
            job_id,
            run_id,
            status,
        });
        info!(job_id = %job_id, run_id = %run_id, ?status, "cron run finished");
        Ok(Some(run_id))
    }

    async fn execute(
        &self,
        job: &CronJob,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(CronRunStatus, u32, String)> {
        let profile = self.resolve_profile(job);

        let mut ctx = ToolContext::new(self.working_dir.clone())
            .with_scope(ExecutionScope::Unattended)
            .with_notifier(Arc::clone(&self.notifier))
            .with_cancel(cancel);
        if let DeliveryTarget::Channel {
            channel_id,
            chat_id,
        } = &job.delivery
        {
            let channel = self.channels.read().get(channel_id).cloned();
            match channel {
                Some(channel) => ctx = ctx.with_channel(channel, chat_id),
                None => {
                    // Still end observably: fall back to the local notifier.
                    warn!(job_id = %job.id, channel_id = %channel_id, "delivery channel not registered — falling back to notifier");
                }
            }
        }

        let config = LoopConfig {
            model: profile
                .model
                .clone()
                .unwrap_or_else(|| self.base_config.model.clone()),
            system_prompt: Some(profile.system_prompt.clone()),
            max_iterations: profile.max_iterations,
            max_tokens: self.base_config.max_tokens,
            temperature: profile.temperature.unwrap_or(self.base_config.temperature),
        };
        let scoped = Arc::new(self.registry.subset(&profile.allowed_tools));
        let agent = Arc::new(
            AgentLoop::new(
                Arc::clone(&self.provider),
                scoped,
                Arc::new(AutoApprove),
                config,
            )
            .with_observer(self.bus.clone(), EventTag::job(job.id, run_id)),
        );

        let history = vec![Message::text(Role::User, job.prompt.clone())];
        let (rx, handle) = agent.spawn(history, ctx.clone());
        self.watch_progress(job.id, run_id, rx).await;

        match handle.await {
            Ok(Ok(outcome)) => {
                let status = if outcome.stop == LoopStop::Cancelled {
                    CronRunStatus::Aborted
                } else {
                    CronRunStatus::Success
                };
                // If no delivery-type tool fired during the run, deliver the
                // final text so the run never disappears silently.
                let text = if outcome.final_text.is_empty() {
                    format!("Scheduled job '{}' completed with no output", job.label)
                } else {
                    outcome.final_text.clone()
                };
                self.deliver(job, &ctx, &text).await;
                Ok((status, outcome.tool_call_count, summarize(&outcome.final_text, 500)))
            }
            Ok(Err(e)) => {
                // Terminal loop failure: record it and notify.
                self.deliver(
                    job,
                    &ctx,
                    &format!("Scheduled job '{}' failed: {e}", job.label),
                )
                .await;
                Err(e)
            }
            Err(e) => {
                self.deliver(
                    job,
                    &ctx,
                    &format!("Scheduled job '{}' failed: {e}", job.label),
                )
                .await;
                Err(ValetError::Agent(format!("cron run task join error: {e}")))
            }
        }
    }

    /// Forward iteration boundaries as correlated progress events.
    async fn watch_progress(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        mut rx: mpsc::Receiver<LoopEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if let LoopEvent::Iteration { iteration, .. } = event {
                let _ = self.events.send(CronEvent::Progress {
                    job_id,
                    run_id,
                    iteration,
                });
            }
        }
    }

    /// End-of-run delivery, subject to the same once-per-run guard the
    /// delivery tools use: if the agent already delivered, this is a no-op.
    async fn deliver(&self, job: &CronJob, ctx: &ToolContext, text: &str) {
        if !ctx.run_state.try_claim_delivery() {
            return;
        }
        let result = match &ctx.channel {
            Some(binding) => binding
                .channel
                .send(&binding.chat_id, text)
                .await
                .map(|_| ()),
            None => self.notifier.notify(&job.label, text).await,
        };
        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "run delivery failed");
        }
    }
}

/// The scheduler tick loop. Spawn as a background task; it fires due jobs
/// until the token is cancelled.
pub async fn run_scheduler(
    runner: Arc<CronAgentRunner>,
    tick: std::time::Duration,
    cancel: CancellationToken,
) {
    info!(tick_secs = tick.as_secs(), "cron scheduler started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cron scheduler stopping");
                return;
            }
            _ = tokio::time::sleep(tick) => {}
        }

        let now = Utc::now();
        for job in runner.store.jobs() {
            if !job.enabled {
                continue;
            }
            let due = match Schedule::from_str(&job.schedule) {
                Ok(schedule) => {
                    let since = job.last_fired.unwrap_or(job.created_at);
                    schedule
                        .after(&since)
                        .next()
                        .is_some_and(|next| next <= now)
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "invalid cron expression — disabling job");
                    runner.store.set_enabled(job.id, false);
                    false
                }
            };
            if due {
                runner.store.mark_fired(job.id, now);
                let runner = Arc::clone(&runner);
                let job_id = job.id;
                tokio::spawn(async move {
                    if let Err(e) = runner.trigger(job_id).await {
                        error!(job_id = %job_id, error = %e, "scheduled trigger failed");
                    }
                });
            }
        }
    }
}
