use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::scheduler::{Clock, CronScheduler, ScheduledJob, SystemClock};
use chrono::{DateTime, Utc};
use common::{RejectedService, RotationJob, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A service's rotation job as seen by the scheduler.
pub struct ServiceTask {
    job: RotationJob,
    metrics: Arc<MetricsCollector>,
    textfile: Option<PathBuf>,
}

impl ServiceTask {
    pub fn new(job: RotationJob, metrics: Arc<MetricsCollector>, textfile: Option<PathBuf>) -> Self {
        Self { job, metrics, textfile }
    }
}

impl ScheduledJob for ServiceTask {
    fn id(&self) -> &str {
        self.job.name()
    }

    fn run(&self) {
        let name = self.job.name();
        let started = Instant::now();

        match self.job.run() {
            Ok(report) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_pass(&report, elapsed_ms);
                if !report.failures.is_empty() {
                    log::warn!(
                        "[{}] {} of {} file(s) failed to rotate for {}",
                        report.pass_id,
                        report.failures.len(),
                        report.failures.len() + report.rotated.len(),
                        name
                    );
                }
                log::info!(
                    "[{}] Rotation pass for {} finished in {}ms: {} rotated, {} archive(s) deleted, retain_count {}",
                    report.pass_id,
                    name,
                    elapsed_ms,
                    report.rotated.len(),
                    report.retention.deleted.len(),
                    report.retain_count
                );
            }
            Err(e) => {
                self.metrics.record_failed_pass(name);
                log::error!("Rotation pass for {} failed: {}", name, e);
            }
        }

        if let Some(path) = &self.textfile {
            if let Err(e) = self.metrics.write_textfile(path) {
                log::warn!("Failed to write metrics textfile {}: {}", path.display(), e);
            }
        }
    }

    fn skipped(&self) {
        self.metrics.record_skipped(self.job.name());
    }
}

/// Owns every configured service's schedule and the shared run loop.
pub struct ServiceSupervisor<C: Clock = SystemClock> {
    scheduler: CronScheduler<C>,
    metrics: Arc<MetricsCollector>,
    textfile: Option<PathBuf>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl ServiceSupervisor<SystemClock> {
    pub fn new(settings: &Config, metrics: Arc<MetricsCollector>) -> common::Result<Self> {
        let scheduler = CronScheduler::new(settings.scheduler.timezone()?);
        Ok(Self::with_scheduler(scheduler, settings, metrics))
    }
}

impl<C: Clock> ServiceSupervisor<C> {
    pub fn with_scheduler(scheduler: CronScheduler<C>, settings: &Config, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            scheduler,
            metrics,
            textfile: settings.metrics.textfile.clone(),
            poll_interval: settings.scheduler.poll_interval(),
            max_concurrent: settings.scheduler.max_concurrent_rotations,
        }
    }

    pub fn len(&self) -> usize {
        self.scheduler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduler.is_empty()
    }

    pub fn next_fire(&self, service: &str) -> Option<DateTime<Utc>> {
        self.scheduler.next_fire(service)
    }

    /// Register one rotation job per service. Services whose schedule cannot
    /// be registered are returned; the rest stay scheduled.
    pub fn register_all(&mut self, services: Vec<ServiceConfig>) -> Vec<RejectedService> {
        let mut rejected = Vec::new();
        let timezone = self.scheduler.timezone();

        for service in services {
            let name = service.name.clone();
            let expression = service.cron_schedule.clone();
            let task = ServiceTask::new(RotationJob::new(service), self.metrics.clone(), self.textfile.clone());

            match self.scheduler.schedule(Arc::new(task), &expression) {
                Ok(next) => {
                    log::info!("Scheduled log rotation for {} at {}", name, next.with_timezone(&timezone));
                }
                Err(error) => {
                    log::error!("Not scheduling {}: {}", name, error);
                    rejected.push(RejectedService { label: name, error });
                }
            }
        }
        rejected
    }

    /// Run until `shutdown` is cancelled; in-flight passes are awaited.
    pub async fn run(self, shutdown: CancellationToken) {
        log::info!(
            "Supervising {} service(s), polling every {:?}",
            self.scheduler.len(),
            self.poll_interval
        );
        self.scheduler
            .run(self.poll_interval, self.max_concurrent, shutdown)
            .await;
    }
}
