//! The job entity.
//!
//! All mutable fields live in one [`JobState`] behind a per-job mutex. The lock
//! is only held for short bookkeeping sections: never across an `.await`,
//! never while calling into the cache, never during store I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::duration::IsoDuration;
use crate::error::Result;
use crate::schedule::Recurrence;
use crate::template::TemplateContext;
use crate::types::{JobRecord, JobStat, JobType, Metadata, NewJob, RemoteProperties};

/// Configuration fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub command: String,
    pub owner: String,
    pub job_type: JobType,
    pub remote_properties: Option<RemoteProperties>,
    pub schedule: String,
    pub epsilon: String,
    pub retries: u32,
    pub on_failure_job: Option<String>,
    pub resume_at_next_scheduled_time: bool,
    pub template_delimiters: String,
}

/// Cancels the pending sleep of an armed job. Never interrupts a run that has
/// already started.
#[derive(Debug)]
pub(crate) struct TimerHandle(AbortHandle);

impl TimerHandle {
    fn cancel(&self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct JobState {
    config: JobConfig,
    parent_jobs: Vec<String>,
    dependent_jobs: Vec<String>,
    disabled: bool,
    metadata: Metadata,
    next_run_at: Option<DateTime<Utc>>,
    is_done: bool,
    stats: VecDeque<JobStat>,
    recurrence: Option<Recurrence>,
    epsilon: Option<IsoDuration>,
    timer: Option<TimerHandle>,
    created_at: DateTime<Utc>,
}

impl JobState {
    fn should_start_waiting(&self) -> bool {
        !self.disabled
            && self.parent_jobs.is_empty()
            && self
                .recurrence
                .is_some_and(|r| !r.is_exhausted(self.metadata.number_of_finished_runs))
    }
}

/// Everything a run needs, copied out of the job so the lock is released
/// before any I/O starts.
#[derive(Debug, Clone)]
pub(crate) struct RunPlan {
    pub id: String,
    pub config: JobConfig,
    pub epsilon: Option<IsoDuration>,
}

impl RunPlan {
    pub fn template_context(&self) -> TemplateContext {
        TemplateContext {
            id: self.id.clone(),
            name: self.config.name.clone(),
            owner: self.config.owner.clone(),
            command: self.config.command.clone(),
            schedule: self.config.schedule.clone(),
            epsilon: self.config.epsilon.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    id: String,
    state: Mutex<JobState>,
}

impl Job {
    /// Build a fresh job from a validated creation payload.
    pub fn new(id: String, new: NewJob, created_at: DateTime<Utc>) -> Self {
        let config = JobConfig {
            name: new.name,
            command: new.command,
            owner: new.owner,
            job_type: new.job_type,
            remote_properties: new.remote_properties,
            schedule: new.schedule,
            epsilon: new.epsilon,
            retries: new.retries,
            on_failure_job: new.on_failure_job,
            resume_at_next_scheduled_time: new.resume_at_next_scheduled_time,
            template_delimiters: new.template_delimiters,
        };
        let mut parent_jobs = Vec::with_capacity(new.parent_jobs.len());
        for parent in new.parent_jobs {
            if !parent_jobs.contains(&parent) {
                parent_jobs.push(parent);
            }
        }
        Self::from_parts(id, config, parent_jobs, created_at, new.disabled)
    }

    fn from_parts(
        id: String,
        config: JobConfig,
        parent_jobs: Vec<String>,
        created_at: DateTime<Utc>,
        disabled: bool,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(JobState {
                config,
                parent_jobs,
                dependent_jobs: Vec::new(),
                disabled,
                metadata: Metadata::default(),
                next_run_at: None,
                is_done: false,
                stats: VecDeque::new(),
                recurrence: None,
                epsilon: None,
                timer: None,
                created_at,
            }),
        }
    }

    /// Rebuild a job from its stored form. Call [`Job::init_schedule`] before
    /// arming it.
    pub fn from_record(record: JobRecord) -> Self {
        let config = JobConfig {
            name: record.name,
            command: record.command,
            owner: record.owner,
            job_type: record.job_type,
            remote_properties: record.remote_properties,
            schedule: record.schedule,
            epsilon: record.epsilon,
            retries: record.retries,
            on_failure_job: record.on_failure_job,
            resume_at_next_scheduled_time: record.resume_at_next_scheduled_time,
            template_delimiters: record.template_delimiters,
        };
        let job = Self::from_parts(
            record.id,
            config,
            record.parent_jobs,
            record.created_at,
            record.disabled,
        );
        {
            let mut state = job.state();
            state.dependent_jobs = record.dependent_jobs;
            state.metadata = record.metadata;
            state.next_run_at = record.next_run_at;
            state.is_done = record.is_done;
            state.stats = record.stats.into();
        }
        job
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Derive the recurrence and epsilon from the raw strings.
    ///
    /// `check_time` rejects a start instant in the past and is only set when
    /// the job is first created.
    pub fn init_schedule(&self, now: DateTime<Utc>, check_time: bool) -> Result<()> {
        let (schedule, epsilon) = {
            let state = self.state();
            (state.config.schedule.clone(), state.config.epsilon.clone())
        };

        let recurrence = if schedule.is_empty() {
            None
        } else {
            Some(Recurrence::parse(&schedule, now, check_time)?)
        };
        let epsilon = if epsilon.is_empty() {
            None
        } else {
            Some(IsoDuration::parse(&epsilon)?)
        };

        let mut state = self.state();
        state.recurrence = recurrence;
        state.epsilon = epsilon;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.state().config.name.clone()
    }

    pub fn config(&self) -> JobConfig {
        self.state().config.clone()
    }

    pub fn metadata(&self) -> Metadata {
        self.state().metadata.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.state().disabled
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done
    }

    pub fn is_one_off(&self) -> bool {
        self.state().config.schedule.is_empty()
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.state().next_run_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state().created_at
    }

    /// True when the job has a live timer.
    pub fn is_armed(&self) -> bool {
        self.state().timer.is_some()
    }

    pub fn recurrence(&self) -> Option<Recurrence> {
        self.state().recurrence
    }

    pub fn parent_jobs(&self) -> Vec<String> {
        self.state().parent_jobs.clone()
    }

    pub fn dependent_jobs(&self) -> Vec<String> {
        self.state().dependent_jobs.clone()
    }

    /// Run history, oldest first.
    pub fn stats(&self) -> Vec<JobStat> {
        self.state().stats.iter().cloned().collect()
    }

    pub fn to_record(&self) -> JobRecord {
        let state = self.state();
        JobRecord {
            id: self.id.clone(),
            name: state.config.name.clone(),
            command: state.config.command.clone(),
            owner: state.config.owner.clone(),
            job_type: state.config.job_type,
            remote_properties: state.config.remote_properties.clone(),
            schedule: state.config.schedule.clone(),
            epsilon: state.config.epsilon.clone(),
            retries: state.config.retries,
            parent_jobs: state.parent_jobs.clone(),
            dependent_jobs: state.dependent_jobs.clone(),
            disabled: state.disabled,
            on_failure_job: state.config.on_failure_job.clone(),
            resume_at_next_scheduled_time: state.config.resume_at_next_scheduled_time,
            template_delimiters: state.config.template_delimiters.clone(),
            metadata: state.metadata.clone(),
            next_run_at: state.next_run_at,
            is_done: state.is_done,
            stats: state.stats.iter().cloned().collect(),
            created_at: state.created_at,
        }
    }

    // --- dependency edges ---------------------------------------------------

    /// Append a dependent. Returns false if it was already registered.
    pub(crate) fn add_dependent(&self, id: &str) -> bool {
        let mut state = self.state();
        if state.dependent_jobs.iter().any(|d| d == id) {
            return false;
        }
        state.dependent_jobs.push(id.to_string());
        true
    }

    /// Remove a dependent by id scan.
    pub(crate) fn remove_dependent(&self, id: &str) -> bool {
        let mut state = self.state();
        let before = state.dependent_jobs.len();
        state.dependent_jobs.retain(|d| d != id);
        state.dependent_jobs.len() != before
    }

    pub(crate) fn remove_parent(&self, id: &str) -> bool {
        let mut state = self.state();
        let before = state.parent_jobs.len();
        state.parent_jobs.retain(|p| p != id);
        state.parent_jobs.len() != before
    }

    // --- enable / disable ---------------------------------------------------

    /// Set the disabled flag, returning the previous value.
    pub(crate) fn set_disabled(&self, disabled: bool) -> bool {
        std::mem::replace(&mut self.state().disabled, disabled)
    }

    pub fn should_start_waiting(&self) -> bool {
        self.state().should_start_waiting()
    }

    // --- timer --------------------------------------------------------------

    /// Compute the next wait and install a new timer in place of the old one.
    ///
    /// `spawn` receives the clamped wait and must start the sleeping task. The
    /// previous timer, if any, is cancelled. Returns the new `next_run_at`, or
    /// `None` when the job has no schedule of its own.
    pub(crate) fn arm<F>(&self, now: DateTime<Utc>, spawn: F) -> Option<DateTime<Utc>>
    where
        F: FnOnce(Duration) -> AbortHandle,
    {
        let mut state = self.state();
        let recurrence = state.recurrence?;
        let wait = recurrence
            .wait_duration(
                now,
                state.metadata.last_attempted_run,
                state.config.resume_at_next_scheduled_time,
            )
            .max(Duration::zero());
        let next = now + wait;
        state.next_run_at = Some(next);
        state.is_done = false;

        let handle = TimerHandle(spawn(wait));
        if let Some(old) = state.timer.replace(handle) {
            old.cancel();
        }
        debug!(job_id = %self.id, next_run_at = %next, wait_ms = wait.num_milliseconds(), "job armed");
        Some(next)
    }

    /// Cancel and drop the pending timer. A run already in progress is not
    /// affected.
    pub(crate) fn disarm(&self) {
        if let Some(timer) = self.state().timer.take() {
            timer.cancel();
        }
    }

    /// The job will not fire again on its own.
    pub(crate) fn settle(&self) {
        let mut state = self.state();
        if let Some(old) = state.timer.take() {
            old.cancel();
        }
        if !state.disabled {
            state.is_done = true;
        }
    }

    // --- run bookkeeping ----------------------------------------------------

    /// Start a run at `now`. Fails without side effects when disabled.
    pub(crate) fn begin_run(&self, now: DateTime<Utc>) -> Result<RunPlan> {
        let mut state = self.state();
        if state.disabled {
            return Err(crate::error::SchedulerError::JobDisabled {
                id: self.id.clone(),
            });
        }
        state.metadata.last_attempted_run = Some(now);
        Ok(RunPlan {
            id: self.id.clone(),
            config: state.config.clone(),
            epsilon: state.epsilon,
        })
    }

    pub(crate) fn record_failure(&self, at: DateTime<Utc>) {
        let mut state = self.state();
        state.metadata.error_count += 1;
        state.metadata.last_error = Some(at);
    }

    /// Commit the outcome of a run and append its stat, keeping at most
    /// `retention` entries.
    pub(crate) fn finish_run(&self, stat: &JobStat, finished: DateTime<Utc>, retention: usize) {
        let mut state = self.state();
        state.metadata.number_of_finished_runs += 1;
        if stat.success {
            state.metadata.success_count += 1;
            state.metadata.last_success = Some(finished);
        }
        state.stats.push_back(stat.clone());
        while state.stats.len() > retention.max(1) {
            state.stats.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn job(schedule: &str) -> Job {
        let j = Job::new(
            "j1".into(),
            NewJob {
                name: "n".into(),
                command: "true".into(),
                schedule: schedule.into(),
                ..Default::default()
            },
            now(),
        );
        j.init_schedule(now(), true).unwrap();
        j
    }

    fn stat(success: bool) -> JobStat {
        JobStat {
            job_id: "j1".into(),
            ran_at: now(),
            number_of_retries: 0,
            success,
            execution_duration_ms: 1,
        }
    }

    #[test]
    fn duplicate_parents_are_collapsed() {
        let j = Job::new(
            "c".into(),
            NewJob {
                name: "c".into(),
                command: "true".into(),
                parent_jobs: vec!["p".into(), "p".into(), "q".into()],
                ..Default::default()
            },
            now(),
        );
        assert_eq!(j.parent_jobs(), vec!["p", "q"]);
    }

    #[test]
    fn dependents_have_no_duplicates() {
        let j = job("");
        assert!(j.add_dependent("a"));
        assert!(!j.add_dependent("a"));
        assert!(j.add_dependent("b"));
        assert_eq!(j.dependent_jobs(), vec!["a", "b"]);
        assert!(j.remove_dependent("a"));
        assert!(!j.remove_dependent("a"));
        assert_eq!(j.dependent_jobs(), vec!["b"]);
    }

    #[test]
    fn disabled_job_refuses_to_start_and_records_nothing() {
        let j = job("");
        j.set_disabled(true);
        assert!(j.begin_run(now()).is_err());
        assert_eq!(j.metadata(), Metadata::default());
    }

    #[test]
    fn fixed_repetitions_stop_waiting_once_exhausted() {
        let j = job("R1/2030-01-01T00:00:10Z/PT10S");
        assert!(j.should_start_waiting());
        j.finish_run(&stat(true), now(), 10);
        assert!(j.should_start_waiting());
        j.finish_run(&stat(false), now(), 10);
        assert!(!j.should_start_waiting());
    }

    #[test]
    fn one_off_and_dependency_only_jobs_never_wait() {
        assert!(!job("").should_start_waiting());

        let child = Job::new(
            "c".into(),
            NewJob {
                name: "c".into(),
                command: "true".into(),
                schedule: "R/2030-01-01T00:00:10Z/PT10S".into(),
                parent_jobs: vec!["p".into()],
                ..Default::default()
            },
            now(),
        );
        child.init_schedule(now(), true).unwrap();
        assert!(!child.should_start_waiting());
    }

    #[test]
    fn stats_are_bounded() {
        let j = job("");
        for _ in 0..5 {
            j.finish_run(&stat(true), now(), 3);
        }
        assert_eq!(j.stats().len(), 3);
        assert_eq!(j.metadata().success_count, 5);
        assert_eq!(j.metadata().number_of_finished_runs, 5);
    }

    #[test]
    fn record_round_trip_keeps_edges_and_metadata() {
        let j = job("R/2030-01-01T00:00:10Z/PT10S");
        j.add_dependent("child");
        j.record_failure(now());
        j.finish_run(&stat(false), now(), 10);

        let record = j.to_record();
        let restored = Job::from_record(record.clone());
        assert_eq!(restored.to_record(), record);
        assert_eq!(restored.metadata().error_count, 1);
        assert_eq!(restored.dependent_jobs(), vec!["child"]);
        assert!(restored.recurrence().is_none());
        restored.init_schedule(now(), false).unwrap();
        assert!(restored.recurrence().is_some());
    }

    #[test]
    fn invalid_epsilon_is_a_config_error() {
        let j = Job::new(
            "e".into(),
            NewJob {
                name: "e".into(),
                command: "true".into(),
                epsilon: "10 minutes".into(),
                ..Default::default()
            },
            now(),
        );
        assert!(j.init_schedule(now(), true).unwrap_err().is_config());
    }
}
