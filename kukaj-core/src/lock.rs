use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::job::{JobError, JobId, JobResult};

#[derive(Debug, Clone, Copy)]
struct Holder {
    job: JobId,
    acquired_at: Instant,
}

/// Process-wide single-flight guard. At most one job may hold the lock;
/// concurrent acquisitions fail fast with `Busy` instead of queueing.
///
/// Staleness is evaluated lazily: a holder past the staleness window is
/// evicted by the next acquisition attempt, so a crashed job cannot wedge
/// the process permanently.
#[derive(Debug)]
pub struct JobLock {
    holder: Mutex<Option<Holder>>,
    staleness: Duration,
}

impl JobLock {
    pub fn new(staleness: Duration) -> Self {
        Self {
            holder: Mutex::new(None),
            staleness,
        }
    }

    pub fn try_acquire(&self, job: JobId) -> JobResult<()> {
        self.try_acquire_at(job, Instant::now())
    }

    pub fn release(&self, job: JobId) -> bool {
        let mut slot = self.lock_slot();
        match *slot {
            Some(holder) if holder.job == job => {
                *slot = None;
                true
            }
            Some(holder) => {
                warn!(held_by = %holder.job, requested_by = %job, "refusing lock release by non-holder");
                false
            }
            None => false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.is_held_at(Instant::now())
    }

    pub fn holder(&self) -> Option<JobId> {
        self.lock_slot().map(|holder| holder.job)
    }

    fn try_acquire_at(&self, job: JobId, now: Instant) -> JobResult<()> {
        let mut slot = self.lock_slot();
        if let Some(holder) = *slot {
            if now.duration_since(holder.acquired_at) <= self.staleness {
                return Err(JobError::Busy { holder: holder.job });
            }
            warn!(evicted = %holder.job, "evicting stale lock holder");
        }
        *slot = Some(Holder {
            job,
            acquired_at: now,
        });
        Ok(())
    }

    fn is_held_at(&self, now: Instant) -> bool {
        match *self.lock_slot() {
            Some(holder) => now.duration_since(holder.acquired_at) <= self.staleness,
            None => false,
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Holder>> {
        // A poisoned mutex only means a panicking thread held it; the
        // Option inside is still coherent.
        match self.holder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
