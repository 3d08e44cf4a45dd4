use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Aggregate view over one snapshot of the cache. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub jobs: usize,
    pub active_jobs: usize,
    pub disabled_jobs: usize,
    pub success_count: u64,
    pub error_count: u64,
    /// Earliest pending run among enabled, armed jobs.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_attempted_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SchedulerStats {
    pub fn collect(jobs: &[Arc<Job>], now: DateTime<Utc>) -> Self {
        let mut stats = SchedulerStats {
            jobs: jobs.len(),
            active_jobs: 0,
            disabled_jobs: 0,
            success_count: 0,
            error_count: 0,
            next_run_at: None,
            last_attempted_run: None,
            created_at: now,
        };

        for job in jobs {
            let meta = job.metadata();
            stats.success_count += meta.success_count;
            stats.error_count += meta.error_count;
            stats.last_attempted_run = stats.last_attempted_run.max(meta.last_attempted_run);

            if job.is_disabled() {
                stats.disabled_jobs += 1;
                continue;
            }
            stats.active_jobs += 1;

            if job.is_armed() {
                if let Some(next) = job.next_run_at() {
                    stats.next_run_at = Some(stats.next_run_at.map_or(next, |n| n.min(next)));
                }
            }
        }
        stats
    }
}
