#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_core::config::{CacheKind, PersistencePolicy};
use cadence_scheduler::{
    CacheOptions, Clock, JobCache, JobDb, JobRecord, JobStat, ManualClock, MemoryJobDb, NewJob,
    SchedulerError,
};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use tokio::sync::broadcast;

pub const KINDS: [CacheKind; 2] = [CacheKind::Locked, CacheKind::LockFree];

pub fn options(kind: CacheKind, persistence: PersistencePolicy) -> CacheOptions {
    CacheOptions {
        kind,
        persistence,
        persist_interval: StdDuration::from_secs(3600),
        stats_retention: 100,
        default_http_timeout: StdDuration::from_secs(5),
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

pub fn manual_cache(
    kind: CacheKind,
    persistence: PersistencePolicy,
) -> (Arc<JobCache>, Arc<ManualClock>, Arc<MemoryJobDb>) {
    let clock = Arc::new(ManualClock::new(epoch()));
    let db = Arc::new(MemoryJobDb::new());
    let cache = JobCache::new(
        db.clone() as Arc<dyn JobDb>,
        clock.clone() as Arc<dyn Clock>,
        options(kind, persistence),
    );
    (cache, clock, db)
}

pub fn system_cache(kind: CacheKind) -> (Arc<JobCache>, Arc<MemoryJobDb>) {
    let db = Arc::new(MemoryJobDb::new());
    let cache = JobCache::with_system_clock(
        db.clone() as Arc<dyn JobDb>,
        options(kind, PersistencePolicy::Transactional),
    );
    (cache, db)
}

pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A schedule whose first run is far enough away never to fire in a test.
pub fn far_schedule() -> String {
    format!("R/{}/PT1H", rfc3339(Utc::now() + Duration::days(3650)))
}

pub fn local(name: &str, command: &str) -> NewJob {
    NewJob {
        name: name.to_string(),
        command: command.to_string(),
        owner: "ops@example.com".to_string(),
        ..Default::default()
    }
}

pub fn scheduled(name: &str, command: &str, schedule: &str) -> NewJob {
    NewJob {
        schedule: schedule.to_string(),
        ..local(name, command)
    }
}

pub fn child(name: &str, command: &str, parents: &[&str]) -> NewJob {
    NewJob {
        parent_jobs: parents.iter().map(|p| p.to_string()).collect(),
        ..local(name, command)
    }
}

/// Shell snippet appending `line` to `path`.
pub fn append(path: &Path, line: &str) -> String {
    format!("echo {line} >> {}", path.display())
}

pub fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Next finished run of job `id`.
pub async fn next_run_of(rx: &mut broadcast::Receiver<JobStat>, id: &str) -> JobStat {
    tokio::time::timeout(StdDuration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(stat) if stat.job_id == id => return stat,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a job run")
}

/// Wait until `n` timers are sleeping on the manual clock.
pub async fn sleepers(clock: &ManualClock, n: usize) {
    tokio::time::timeout(StdDuration::from_secs(5), async {
        while clock.sleepers() < n {
            tokio::time::sleep(StdDuration::from_millis(2)).await;
        }
    })
    .await
    .expect("timer never armed");
}

/// Store wrapper whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyDb {
    pub inner: MemoryJobDb,
    pub fail_saves: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Every save takes 100ms.
    pub slow_saves: AtomicBool,
    /// Saves for this job id always fail.
    pub poisoned_id: std::sync::Mutex<Option<String>>,
}

impl FlakyDb {
    pub fn fail_saves(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }

    fn broken() -> SchedulerError {
        SchedulerError::Io(std::io::Error::other("store unavailable"))
    }
}

impl JobDb for FlakyDb {
    fn get_all(&self) -> cadence_scheduler::Result<Vec<JobRecord>> {
        self.inner.get_all()
    }

    fn get(&self, id: &str) -> cadence_scheduler::Result<JobRecord> {
        self.inner.get(id)
    }

    fn delete(&self, id: &str) -> cadence_scheduler::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::broken());
        }
        self.inner.delete(id)
    }

    fn save(&self, job: &JobRecord) -> cadence_scheduler::Result<()> {
        if self.slow_saves.load(Ordering::SeqCst) {
            std::thread::sleep(StdDuration::from_millis(100));
        }
        let poisoned = self.poisoned_id.lock().unwrap().clone();
        if self.fail_saves.load(Ordering::SeqCst) || poisoned.as_deref() == Some(job.id.as_str())
        {
            return Err(Self::broken());
        }
        self.inner.save(job)
    }

    fn close(&self) -> cadence_scheduler::Result<()> {
        self.inner.close()
    }
}
