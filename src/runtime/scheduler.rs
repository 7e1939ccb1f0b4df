/// Background wait scheduler
///
/// Drives time-based suspensions forward without any client request. A
/// repeated tokio-cron-scheduler job scans every known database each tick,
/// resolves elapsed waits and reclaims queue messages stuck in processing.

use crate::{service::WorkflowService, store::StoreRegistry};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Outcome of one scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub databases: usize,
    pub waits_resolved: usize,
    pub messages_reclaimed: usize,
    pub failures: usize,
}

pub struct WaitScheduler {
    scheduler: RwLock<JobScheduler>,
    job_uuid: RwLock<Option<Uuid>>,
    registry: Arc<StoreRegistry>,
    service: Arc<WorkflowService>,
    interval: Duration,
    /// Held for the duration of a tick
    in_flight: Arc<Mutex<()>>,
}

impl WaitScheduler {
    pub async fn new(
        registry: Arc<StoreRegistry>,
        service: Arc<WorkflowService>,
        interval: Duration,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: RwLock::new(scheduler),
            job_uuid: RwLock::new(None),
            registry,
            service,
            interval,
            in_flight: Arc::new(Mutex::new(())),
        })
    }

    /// Register the repeated tick job and start the scheduler
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::info!("Starting wait scheduler (tick every {:?})", self.interval);

        let this = Arc::clone(self);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                // A tick still running delays the next one
                let Ok(_running) = this.in_flight.try_lock() else {
                    tracing::debug!("Previous wait scheduler tick still running, skipping");
                    return;
                };
                this.run_tick().await;
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            let job_uuid = scheduler.add(job).await?;
            scheduler.start().await?;
            job_uuid
        };
        *self.job_uuid.write().await = Some(job_uuid);

        tracing::info!("Wait scheduler started");
        Ok(())
    }

    /// Remove the tick job and shut the scheduler down
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("Stopping wait scheduler");

        if let Some(job_uuid) = self.job_uuid.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("Failed to remove wait scheduler job: {}", e);
            }
        }

        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Run one tick now, waiting for a tick already in progress
    pub async fn tick(&self) -> TickReport {
        let _running = self.in_flight.lock().await;
        self.run_tick().await
    }

    /// Scan every known database; a failing database never stops the others
    async fn run_tick(&self) -> TickReport {
        let db_names = self.registry.known_db_names().await;
        let mut report = TickReport {
            databases: db_names.len(),
            ..TickReport::default()
        };

        for db_name in &db_names {
            match self.service.process_waits(db_name).await {
                Ok(0) => {}
                Ok(resolved) => {
                    tracing::info!("Resumed {} elapsed waits in '{}'", resolved, db_name);
                    report.waits_resolved += resolved;
                }
                Err(e) => {
                    tracing::error!("Error processing waits for '{}': {}", db_name, e);
                    report.failures += 1;
                }
            }

            match self.service.cleanup_stuck_messages(db_name).await {
                Ok(reclaimed) => report.messages_reclaimed += reclaimed,
                Err(e) => {
                    tracing::error!("Error reclaiming stuck messages for '{}': {}", db_name, e);
                    report.failures += 1;
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for WaitScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitScheduler")
            .field("interval", &self.interval)
            .finish()
    }
}
