//! The job cache: live jobs in memory, bridged to a [`JobDb`].
//!
//! The cache owns the only shared job registry and is handed to every part of
//! the scheduler that needs a lookup. Timer tasks hold it weakly, so dropping
//! the last strong handle (after [`JobCache::shutdown`]) lets them wind down.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration as StdDuration;

use cadence_core::config::{CacheConfig, CacheKind, CadenceConfig, PersistencePolicy};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::JobDb;
use crate::dependency;
use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::map::{new_job_map, JobMap};
use crate::runner;
use crate::stats::SchedulerStats;
use crate::types::{JobStat, NewJob};

const EVENT_CAPACITY: usize = 256;

/// Construction parameters for [`JobCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub kind: CacheKind,
    pub persistence: PersistencePolicy,
    pub persist_interval: StdDuration,
    pub stats_retention: usize,
    /// Used by remote jobs that leave `timeout_secs` at 0.
    pub default_http_timeout: StdDuration,
}

impl CacheOptions {
    pub fn from_config(config: &CadenceConfig) -> Self {
        let cache = &config.cache;
        Self {
            kind: cache.kind,
            persistence: cache.persistence,
            persist_interval: StdDuration::from_secs(cache.persist_interval_secs),
            stats_retention: cache.stats_retention,
            default_http_timeout: StdDuration::from_secs(config.jobs.default_http_timeout_secs),
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            kind: cache.kind,
            persistence: cache.persistence,
            persist_interval: StdDuration::from_secs(cache.persist_interval_secs),
            stats_retention: cache.stats_retention,
            default_http_timeout: StdDuration::from_secs(
                cadence_core::config::DEFAULT_HTTP_TIMEOUT_SECS,
            ),
        }
    }
}

pub struct JobCache {
    jobs: Box<dyn JobMap>,
    db: Arc<dyn JobDb>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    options: CacheOptions,
    events: broadcast::Sender<JobStat>,
    shutdown: watch::Sender<bool>,
    persister: Mutex<Option<JoinHandle<()>>>,
    /// Held across "still cached?" plus `db.save`, and across `db.delete`
    /// plus removal from the map, so a save never lands after a delete.
    store_lock: Mutex<()>,
}

impl JobCache {
    pub fn new(db: Arc<dyn JobDb>, clock: Arc<dyn Clock>, options: CacheOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            jobs: new_job_map(options.kind),
            db,
            clock,
            http: reqwest::Client::new(),
            options,
            events,
            shutdown,
            persister: Mutex::new(None),
            store_lock: Mutex::new(()),
        })
    }

    pub fn with_system_clock(db: Arc<dyn JobDb>, options: CacheOptions) -> Arc<Self> {
        Self::new(db, Arc::new(SystemClock), options)
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn db(&self) -> &Arc<dyn JobDb> {
        &self.db
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Receive every finished run's [`JobStat`].
    pub fn subscribe(&self) -> broadcast::Receiver<JobStat> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, stat: JobStat) {
        // No receivers is fine.
        let _ = self.events.send(stat);
    }

    // --- lookup -------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<Arc<Job>> {
        self.jobs.get(id).ok_or_else(|| SchedulerError::not_found(id))
    }

    /// Snapshot of every cached job.
    pub fn get_all(&self) -> Vec<Arc<Job>> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// True when `job` is the instance currently registered under its id.
    pub(crate) fn is_cached(&self, job: &Arc<Job>) -> bool {
        self.jobs
            .get(job.id())
            .is_some_and(|current| Arc::ptr_eq(&current, job))
    }

    // --- mutation -----------------------------------------------------------

    /// Register `job`; with transactional persistence it is saved before
    /// returning.
    pub fn set(&self, job: &Arc<Job>) -> Result<()> {
        self.jobs.insert(Arc::clone(job));
        self.write_through(job)
    }

    /// Save `job` now when persistence is transactional; no-op otherwise.
    pub(crate) fn write_through(&self, job: &Arc<Job>) -> Result<()> {
        match self.options.persistence {
            PersistencePolicy::Transactional => self.save_cached(job).map(|_| ()),
            PersistencePolicy::Periodic => Ok(()),
        }
    }

    /// Save `job` unless it has been deleted. Returns whether it was saved.
    fn save_cached(&self, job: &Arc<Job>) -> Result<bool> {
        let _guard = self.store_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_cached(job) {
            debug!(job_id = %job.id(), "job is no longer cached; not saving");
            return Ok(false);
        }
        self.db.save(&job.to_record())?;
        Ok(true)
    }

    /// Validate, register and schedule a new job.
    ///
    /// Configuration errors are returned before anything is registered. A
    /// job with parents only runs through its parents' cascade; a job without
    /// a schedule runs once, right away.
    #[instrument(skip_all, fields(name = %new.name))]
    pub fn add_job(self: &Arc<Self>, new: NewJob) -> Result<Arc<Job>> {
        new.validate()?;
        let parents = new
            .parent_jobs
            .iter()
            .map(|id| self.get(id))
            .collect::<Result<Vec<_>>>()?;

        let now = self.clock.now();
        let job = Arc::new(Job::new(Uuid::new_v4().to_string(), new, now));
        job.init_schedule(now, true)?;

        if let Err(e) = self.set(&job) {
            self.jobs.remove(job.id());
            return Err(e);
        }
        dependency::attach(self, &job, &parents);
        info!(job_id = %job.id(), "job added");

        if !parents.is_empty() {
            debug!(job_id = %job.id(), parents = parents.len(), "dependent job waits for its parents");
        } else if job.is_one_off() {
            if !job.is_disabled() {
                runner::spawn_run(Arc::clone(self), Arc::clone(&job));
            }
        } else if job.should_start_waiting() {
            runner::start_waiting(self, &job);
        }
        Ok(job)
    }

    /// Remove a job, its timer and its graph edges.
    ///
    /// The store delete always happens first; a store that no longer has the
    /// job is logged, anything else aborts with no change. Children whose only
    /// parent this was are deleted too. A run still in flight finishes but is
    /// never written back.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<()> {
        let job = self.get(id)?;
        {
            let _guard = self.store_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.db.delete(id) {
                Ok(()) => {}
                Err(SchedulerError::JobNotFound { .. }) => {
                    debug!(job_id = %id, "job was not in the store");
                }
                Err(e) => return Err(e),
            }
            self.jobs.remove(id);
        }

        job.disarm();
        dependency::detach(self, &job);
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Clear the disabled flag and re-arm the job if it still has runs left.
    #[instrument(skip(self))]
    pub fn enable(self: &Arc<Self>, id: &str) -> Result<Arc<Job>> {
        let job = self.get(id)?;
        let was_disabled = job.set_disabled(false);
        if let Err(e) = self.write_through(&job) {
            job.set_disabled(was_disabled);
            return Err(e);
        }
        if was_disabled && job.should_start_waiting() {
            runner::start_waiting(self, &job);
        }
        info!(job_id = %id, "job enabled");
        Ok(job)
    }

    /// Set the disabled flag and cancel the pending timer. A run already in
    /// progress finishes normally.
    #[instrument(skip(self))]
    pub fn disable(&self, id: &str) -> Result<Arc<Job>> {
        let job = self.get(id)?;
        let was_disabled = job.set_disabled(true);
        if let Err(e) = self.write_through(&job) {
            job.set_disabled(was_disabled);
            return Err(e);
        }
        job.disarm();
        info!(job_id = %id, "job disabled");
        Ok(job)
    }

    /// Run a job now and wait for the run (and its cascade) to finish.
    pub async fn run_job(self: &Arc<Self>, id: &str) -> Result<JobStat> {
        let job = self.get(id)?;
        runner::run(Arc::clone(self), job).await
    }

    /// Run a job now in the background.
    pub fn start_job(self: &Arc<Self>, id: &str) -> Result<()> {
        let job = self.get(id)?;
        info!(job_id = %id, "manual run requested");
        runner::spawn_run(Arc::clone(self), job);
        Ok(())
    }

    // --- persistence --------------------------------------------------------

    /// Save every cached job. One failing job does not stop the others, and a
    /// job deleted while the sweep runs is skipped.
    pub fn persist(&self) -> Result<()> {
        let jobs = self.get_all();
        let total = jobs.len();
        let mut failed = 0usize;
        let mut first: Option<String> = None;

        for job in &jobs {
            if let Err(e) = self.save_cached(job) {
                warn!(job_id = %job.id(), error = %e, "failed to persist job");
                failed += 1;
                first.get_or_insert_with(|| e.to_string());
            }
        }

        match first {
            None => {
                debug!(total, "jobs persisted");
                Ok(())
            }
            Some(first) => Err(SchedulerError::Persistence {
                failed,
                total,
                first,
            }),
        }
    }

    /// Load every stored job, re-arm timers and start the periodic sweep.
    ///
    /// Must be called before serving requests. One-off jobs that never got to
    /// run before the last shutdown are run now.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let records = self.db.get_all()?;
        let now = self.clock.now();

        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            let job = Arc::new(Job::from_record(record));
            if let Err(e) = job.init_schedule(now, false) {
                warn!(job_id = %job.id(), error = %e, "stored job has an invalid schedule; it will not be armed");
            }
            self.jobs.insert(Arc::clone(&job));
            loaded.push(job);
        }

        for job in &loaded {
            if job.should_start_waiting() {
                runner::start_waiting(self, job);
            } else if job.is_one_off()
                && job.parent_jobs().is_empty()
                && !job.is_disabled()
                && job.metadata().last_attempted_run.is_none()
            {
                info!(job_id = %job.id(), "running one-off job that never ran");
                runner::spawn_run(Arc::clone(self), Arc::clone(job));
            }
        }

        if self.options.persistence == PersistencePolicy::Periodic {
            let handle = tokio::spawn(persist_loop(
                Arc::downgrade(self),
                self.options.persist_interval,
                self.shutdown.subscribe(),
            ));
            let previous = self
                .persister
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(handle);
            if let Some(previous) = previous {
                previous.abort();
            }
        }

        info!(jobs = loaded.len(), persistence = ?self.options.persistence, "job cache started");
        Ok(())
    }

    /// Stop the sweep, cancel timers, persist everything and close the store.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let persister = self
            .persister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = persister {
            let _ = handle.await;
        }

        for job in self.get_all() {
            job.disarm();
        }
        let persisted = self.persist();
        if let Err(e) = &persisted {
            error!(error = %e, "final persistence failed");
        }
        self.db.close()?;
        info!("job cache shut down");
        persisted
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats::collect(&self.get_all(), self.clock.now())
    }
}

async fn persist_loop(
    cache: Weak<JobCache>,
    every: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if let Err(e) = cache.persist() {
                    error!("periodic persistence failed: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("persistence loop stopping");
                    break;
                }
            }
        }
    }
}
