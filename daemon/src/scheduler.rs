use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common::{CronExpr, Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Work the scheduler can fire. `run` blocks and is always called off the
/// scheduling task.
pub trait ScheduledJob: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn run(&self);

    /// A fire time arrived while the previous run was still active.
    fn skipped(&self) {}
}

struct ScheduleEntry {
    job: Arc<dyn ScheduledJob>,
    expr: CronExpr,
    next_fire: DateTime<Utc>,
    running: Arc<AtomicBool>,
}

/// A job claimed by `tick`. The job's running flag is released when this is
/// dropped, after `run` returns or unwinds.
pub struct DueJob {
    job: Arc<dyn ScheduledJob>,
    running: Arc<AtomicBool>,
}

impl DueJob {
    pub fn id(&self) -> &str {
        self.job.id()
    }

    pub fn run(self) {
        self.job.run();
    }
}

impl Drop for DueJob {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct CronScheduler<C: Clock = SystemClock> {
    entries: BTreeMap<String, ScheduleEntry>,
    clock: C,
    timezone: Tz,
}

impl CronScheduler<SystemClock> {
    pub fn new(timezone: Tz) -> Self {
        Self::with_clock(SystemClock, timezone)
    }
}

impl<C: Clock> CronScheduler<C> {
    pub fn with_clock(clock: C, timezone: Tz) -> Self {
        Self {
            entries: BTreeMap::new(),
            clock,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|entry| entry.next_fire)
    }

    /// Register `job` and return its first fire time, computed from the clock.
    pub fn schedule(&mut self, job: Arc<dyn ScheduledJob>, expression: &str) -> Result<DateTime<Utc>> {
        let id = job.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(Error::config(format!("job '{}' is already scheduled", id)));
        }

        let expr = common::parse_cron(expression)?;
        let next_fire = next_fire_after(&expr, self.timezone, self.clock.now())
            .ok_or_else(|| Error::scheduling(expression, "expression has no upcoming fire time"))?;

        self.entries.insert(
            id,
            ScheduleEntry {
                job,
                expr,
                next_fire,
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(next_fire)
    }

    /// Claim every job due at `now` and move its next fire past `now`.
    ///
    /// The next fire is computed from `now`, not from the missed fire time,
    /// so a late tick never produces a backlog. A job whose previous run is
    /// still active is skipped for this fire.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if entry.next_fire > now {
                continue;
            }

            if entry.running.swap(true, Ordering::AcqRel) {
                log::warn!("Skipping rotation for {}: previous run still active", id);
                entry.job.skipped();
            } else {
                due.push(DueJob {
                    job: entry.job.clone(),
                    running: entry.running.clone(),
                });
            }

            match next_fire_after(&entry.expr, self.timezone, now) {
                Some(next) => entry.next_fire = next,
                None => {
                    log::error!("Schedule '{}' for {} has no further fire times, dropping it", entry.expr, id);
                    exhausted.push(id.clone());
                }
            }
        }

        for id in exhausted {
            self.entries.remove(&id);
        }
        due
    }

    /// Poll every `poll_interval`, dispatching due jobs onto the blocking
    /// pool (at most `max_concurrent` at once). Returns once `shutdown` is
    /// cancelled and every in-flight job has finished; jobs still waiting
    /// for a slot at that point are dropped without running.
    pub async fn run(mut self, poll_interval: Duration, max_concurrent: usize, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut in_flight = JoinSet::new();
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = self.clock.now();
            for job in self.tick(now) {
                let permits = permits.clone();
                let shutdown = shutdown.clone();
                in_flight.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let id = job.id().to_string();
                    // queued behind the semaphore when shutdown arrived
                    if shutdown.is_cancelled() {
                        log::info!("Not starting {}: shutting down", id);
                        return;
                    }
                    if let Err(e) = tokio::task::spawn_blocking(move || job.run()).await {
                        log::error!("Job {} aborted: {}", id, e);
                    }
                });
            }

            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    log::error!("Dispatch task failed: {}", e);
                }
            }
        }

        if !in_flight.is_empty() {
            log::info!("Waiting for {} in-flight rotation(s) to finish", in_flight.len());
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                log::error!("Dispatch task failed: {}", e);
            }
        }
    }
}

fn next_fire_after(expr: &CronExpr, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    expr.next_after(&after.with_timezone(&timezone))
        .map(|next| next.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(time: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(time)))
        }

        fn set(&self, time: DateTime<Utc>) {
            *self.0.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct CountingJob {
        id: String,
        runs: AtomicUsize,
        skips: AtomicUsize,
        delay: Duration,
    }

    impl CountingJob {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.to_string(), ..Default::default() })
        }
    }

    impl ScheduledJob for CountingJob {
        fn id(&self) -> &str {
            &self.id
        }

        fn run(&self) {
            std::thread::sleep(self.delay);
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn skipped(&self) {
            self.skips.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_schedule_computes_first_fire_from_clock() {
        let clock = ManualClock::at(utc(10, 0, 0));
        let mut scheduler = CronScheduler::with_clock(clock, chrono_tz::UTC);

        let next = scheduler.schedule(CountingJob::new("api"), "0 0 * * *").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(scheduler.next_fire("api"), Some(next));
    }

    #[test]
    fn test_invalid_or_duplicate_registration() {
        let mut scheduler = CronScheduler::with_clock(ManualClock::at(utc(0, 0, 0)), chrono_tz::UTC);

        let err = scheduler.schedule(CountingJob::new("bad"), "every 5 minutes").unwrap_err();
        assert!(matches!(err, Error::Scheduling { .. }));

        scheduler.schedule(CountingJob::new("api"), "* * * * *").unwrap();
        assert!(scheduler.schedule(CountingJob::new("api"), "* * * * *").is_err());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_tick_runs_due_jobs_and_reseeds_from_now() {
        let clock = ManualClock::at(utc(10, 0, 0));
        let mut scheduler = CronScheduler::with_clock(clock, chrono_tz::UTC);
        let fast = CountingJob::new("fast");
        let slow = CountingJob::new("slow");
        scheduler.schedule(fast.clone(), "*/5 * * * *").unwrap();
        scheduler.schedule(slow.clone(), "0 * * * *").unwrap();

        assert!(scheduler.tick(utc(10, 4, 59)).is_empty());

        let due = scheduler.tick(utc(10, 5, 3));
        assert_eq!(due.iter().map(|d| d.id()).collect::<Vec<_>>(), vec!["fast"]);
        due.into_iter().for_each(DueJob::run);
        assert_eq!(fast.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.next_fire("fast"), Some(utc(10, 10, 0)));

        // a late tick fires once, then moves on from the tick time
        let due = scheduler.tick(utc(10, 37, 0));
        assert_eq!(due.len(), 1);
        drop(due);
        assert_eq!(scheduler.next_fire("fast"), Some(utc(10, 40, 0)));
        assert_eq!(scheduler.next_fire("slow"), Some(utc(11, 0, 0)));
    }

    #[test]
    fn test_overlapping_fire_is_skipped_not_queued() {
        let mut scheduler = CronScheduler::with_clock(ManualClock::at(utc(9, 0, 0)), chrono_tz::UTC);
        let job = CountingJob::new("busy");
        scheduler.schedule(job.clone(), "* * * * *").unwrap();

        let mut first = scheduler.tick(utc(9, 1, 0));
        assert_eq!(first.len(), 1);
        let in_progress = first.remove(0);

        assert!(scheduler.tick(utc(9, 2, 0)).is_empty());
        assert_eq!(job.skips.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.next_fire("busy"), Some(utc(9, 3, 0)));

        in_progress.run();
        let next = scheduler.tick(utc(9, 3, 0));
        assert_eq!(next.len(), 1);
        assert_eq!(job.skips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_fire_uses_scheduler_timezone() {
        let tokyo = common::parse_timezone("Asia/Tokyo").unwrap();
        let mut scheduler = CronScheduler::with_clock(ManualClock::at(utc(0, 0, 0)), tokyo);

        // 03:00 in Tokyo is 18:00 UTC the day before
        let next = scheduler.schedule(CountingJob::new("jp"), "0 3 * * *").unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_and_drains_on_shutdown() {
        let clock = ManualClock::at(utc(12, 0, 0));
        let mut scheduler = CronScheduler::with_clock(clock.clone(), chrono_tz::UTC);
        let job = Arc::new(CountingJob {
            id: "slow".to_string(),
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let other = CountingJob::new("other");
        scheduler.schedule(job.clone(), "* * * * *").unwrap();
        scheduler.schedule(other.clone(), "* * * * *").unwrap();

        clock.set(utc(12, 1, 0));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(Duration::from_millis(10), 2, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // cancelled mid-run, yet the in-flight job completed before run returned
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(other.runs.load(Ordering::SeqCst), 1);
        assert_eq!(job.skips.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_queued_jobs_do_not_start_after_shutdown() {
        let clock = ManualClock::at(utc(8, 0, 0));
        let mut scheduler = CronScheduler::with_clock(clock.clone(), chrono_tz::UTC);
        let jobs: Vec<Arc<CountingJob>> = ["a", "b"]
            .iter()
            .map(|id| {
                Arc::new(CountingJob {
                    id: id.to_string(),
                    delay: Duration::from_millis(200),
                    ..Default::default()
                })
            })
            .collect();
        for job in &jobs {
            scheduler.schedule(job.clone(), "* * * * *").unwrap();
        }

        clock.set(utc(8, 1, 0));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(Duration::from_millis(10), 1, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // one slot: the first job finished, the queued one never started
        let runs: usize = jobs.iter().map(|job| job.runs.load(Ordering::SeqCst)).sum();
        assert_eq!(runs, 1);
    }
}
