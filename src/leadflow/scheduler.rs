//! Durable, time-based follow-up scheduler.
//!
//! Ticks on a fixed interval. Each tick atomically leases every due
//! job from the store, then dispatches each job's action list through
//! the response processor under the target thread's lock, so a
//! follow-up never interleaves with a concurrently processed inbound
//! message. Leases bound re-firing after a crash: a leased job whose
//! lease expired becomes eligible again, and duplicate sends to the
//! provider are possible and accepted; the stage commit itself is
//! idempotent through the store.
//!
//! A job that comes due while the thread is under human takeover is
//! suppressed and marked cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::leadflow::error::StoreError;
use crate::leadflow::funnel::Action;
use crate::leadflow::locks::ThreadLocks;
use crate::leadflow::processor::{ExecutionStatus, ResponseProcessor};
use crate::leadflow::store::{JobStatus, ScheduledJob, Store};

pub struct Scheduler {
    store: Arc<Store>,
    processor: Arc<ResponseProcessor>,
    locks: Arc<ThreadLocks>,
    tick: Duration,
    lease: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        processor: Arc<ResponseProcessor>,
        locks: Arc<ThreadLocks>,
        tick: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            locks,
            tick,
            lease,
        }
    }

    /// Run the tick loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = self.run_once().await {
                    log::error!("Scheduler tick failed: {}", err);
                }
            }
        })
    }

    /// One tick: lease and dispatch everything due. Returns how many
    /// jobs fired.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let due = self.store.due_jobs(Utc::now(), self.lease).await?;
        let mut fired = 0usize;
        for job in due {
            if self.dispatch(&job).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Dispatch one leased job under its thread's lock.
    async fn dispatch(&self, job: &ScheduledJob) -> Result<bool, StoreError> {
        let _guard = self.locks.acquire(job.thread_id).await;

        // Re-read under the lock: an inbound may have cancelled the
        // job's reason for existing, or an operator may have taken
        // over.
        let thread = match self.store.thread(job.thread_id).await {
            Some(thread) => thread,
            None => {
                log::warn!("Dropping job {} for unknown thread {}", job.key, job.thread_id);
                self.store.complete_job(job.id, JobStatus::Failed).await?;
                return Ok(false);
            }
        };
        if thread.human_takeover {
            self.store.complete_job(job.id, JobStatus::Cancelled).await?;
            return Ok(false);
        }
        let contact = match self.store.contact(thread.contact_id).await {
            Some(contact) => contact,
            None => {
                self.store.complete_job(job.id, JobStatus::Failed).await?;
                return Ok(false);
            }
        };

        let actions: Vec<Action> = match serde_json::from_value(job.actions.clone()) {
            Ok(actions) => actions,
            Err(err) => {
                log::error!("Job {} has undecodable action payload: {}", job.key, err);
                self.store.complete_job(job.id, JobStatus::Failed).await?;
                return Ok(false);
            }
        };

        let report = self.processor.execute(&thread, &contact, &actions).await?;
        match report.status {
            ExecutionStatus::Completed => {
                self.store.complete_job(job.id, JobStatus::Fired).await?;
                log::info!(
                    "Scheduled job {} fired on thread {} ({} artifacts)",
                    job.key,
                    thread.id,
                    report.sent
                );
                Ok(true)
            }
            ExecutionStatus::Aborted => {
                self.store.complete_job(job.id, JobStatus::Failed).await?;
                Ok(false)
            }
        }
    }
}
