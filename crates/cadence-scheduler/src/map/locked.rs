use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::JobMap;
use crate::job::Job;

/// A `HashMap` behind one reader/writer lock. Writers are serialized.
#[derive(Debug, Default)]
pub struct LockedMap {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobMap for LockedMap {
    fn get(&self, id: &str) -> Option<Arc<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(id).cloned()
    }

    fn insert(&self, job: Arc<Job>) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id().to_string(), job);
    }

    fn remove(&self, id: &str) -> Option<Arc<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.remove(id)
    }

    fn values(&self) -> Vec<Arc<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
