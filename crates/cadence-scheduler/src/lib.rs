//! `cadence-scheduler`: ISO-8601 job scheduling with pluggable persistence.
//!
//! # Overview
//!
//! Jobs are registered with a [`JobCache`], which keeps them in memory and
//! persists them through a [`db::JobDb`]. Every scheduled job owns one timer
//! task; when it fires the job runs (local `sh -c` command or remote HTTP
//! call), retries within its epsilon window, records a [`JobStat`], runs its
//! dependents in registration order and re-arms itself.
//!
//! # Schedules
//!
//! | Schedule                          | Behaviour                                  |
//! |-----------------------------------|--------------------------------------------|
//! | *(empty)*                         | One-off: runs once, immediately            |
//! | `R/2030-01-01T09:00:00Z/P1D`      | Every day from the start instant, forever  |
//! | `R5/2030-01-01T09:00:00Z/PT30M`   | Six runs in total, 30 minutes apart        |
//! | `R0/2030-01-01T09:00:00Z/`        | Once, at the start instant                 |
//!
//! Jobs with parents never run on their own schedule; they run after each
//! successful run of a parent.
//!
//! # Caches
//!
//! [`map::LockedMap`] guards a `HashMap` with one `RwLock`;
//! [`map::SortedIndexMap`] is a lock-free sorted list with an atomic
//! skip-index for read-heavy use. Both sit behind [`map::JobMap`].

pub mod cache;
pub mod clock;
pub mod db;
mod dependency;
pub mod duration;
pub mod error;
pub mod job;
pub mod map;
mod runner;
pub mod schedule;
pub mod stats;
pub mod template;
pub mod types;

pub use cache::{CacheOptions, JobCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{JobDb, MemoryJobDb, SqliteJobDb};
pub use error::{Result, SchedulerError};
pub use job::Job;
pub use stats::SchedulerStats;
pub use types::{JobRecord, JobStat, JobType, Metadata, NewJob, RemoteProperties};
