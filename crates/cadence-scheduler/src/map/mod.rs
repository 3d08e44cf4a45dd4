//! In-memory job maps behind [`crate::JobCache`].
//!
//! Both implementations satisfy the same contract and are selected by
//! [`cadence_core::config::CacheKind`]:
//!
//! | Map               | Reads                 | Writes                       |
//! |-------------------|-----------------------|------------------------------|
//! | [`LockedMap`]     | shared `RwLock` guard | exclusive `RwLock` guard     |
//! | [`SortedIndexMap`]| no lock, epoch pinned | CAS on the sorted list/index |

mod arena;
mod locked;
mod lockfree;

use std::sync::Arc;

use cadence_core::config::CacheKind;

use crate::job::Job;

pub use locked::LockedMap;
pub use lockfree::SortedIndexMap;

/// Concurrent id → job map.
pub trait JobMap: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<Job>>;

    /// Insert or replace, keyed by `job.id()`.
    fn insert(&self, job: Arc<Job>);

    fn remove(&self, id: &str) -> Option<Arc<Job>>;

    /// Point-in-time copy of every live job.
    fn values(&self) -> Vec<Arc<Job>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobMap for SortedIndexMap<Arc<Job>> {
    fn get(&self, id: &str) -> Option<Arc<Job>> {
        SortedIndexMap::get(self, id)
    }

    fn insert(&self, job: Arc<Job>) {
        let id = job.id().to_string();
        SortedIndexMap::insert(self, &id, job);
    }

    fn remove(&self, id: &str) -> Option<Arc<Job>> {
        SortedIndexMap::remove(self, id)
    }

    fn values(&self) -> Vec<Arc<Job>> {
        self.entries().into_iter().map(|(_, job)| job).collect()
    }

    fn len(&self) -> usize {
        SortedIndexMap::len(self)
    }
}

pub fn new_job_map(kind: CacheKind) -> Box<dyn JobMap> {
    match kind {
        CacheKind::Locked => Box::new(LockedMap::default()),
        CacheKind::LockFree => Box::new(SortedIndexMap::<Arc<Job>>::new()),
    }
}
