//! Parent/child edges between jobs.
//!
//! For every live job `j` and parent `p`:
//! `j.id ∈ p.dependent_jobs ⟺ p.id ∈ j.parent_jobs`. Edges are found by id
//! scan, never by position, and never duplicated.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::JobCache;
use crate::error::SchedulerError;
use crate::job::Job;

/// Register `child` as a dependent of each parent, in order.
pub(crate) fn attach(cache: &JobCache, child: &Job, parents: &[Arc<Job>]) {
    for parent in parents {
        if parent.add_dependent(child.id()) {
            debug!(parent_id = %parent.id(), job_id = %child.id(), "dependent attached");
            if let Err(e) = cache.write_through(parent) {
                warn!(parent_id = %parent.id(), error = %e, "failed to persist parent after attach");
            }
        }
    }
}

/// Undo every edge of a job that was just removed from the cache.
///
/// Children left without any parent are deleted as well; children with other
/// parents only lose the edge.
pub(crate) fn detach(cache: &JobCache, job: &Job) {
    for parent_id in job.parent_jobs() {
        let Ok(parent) = cache.get(&parent_id) else {
            continue;
        };
        if parent.remove_dependent(job.id()) {
            if let Err(e) = cache.write_through(&parent) {
                warn!(parent_id = %parent_id, error = %e, "failed to persist parent after detach");
            }
        }
    }

    for child_id in job.dependent_jobs() {
        let Ok(child) = cache.get(&child_id) else {
            continue;
        };
        let parents = child.parent_jobs();
        if parents.iter().all(|p| p == job.id()) {
            debug!(job_id = %child_id, parent_id = %job.id(), "cascading delete to orphaned child");
            match cache.delete(&child_id) {
                Ok(()) | Err(SchedulerError::JobNotFound { .. }) => {}
                Err(e) => warn!(job_id = %child_id, error = %e, "cascade delete failed"),
            }
        } else if child.remove_parent(job.id()) {
            if let Err(e) = cache.write_through(&child) {
                warn!(job_id = %child_id, error = %e, "failed to persist child after detach");
            }
        }
    }
}
