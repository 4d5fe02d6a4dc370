//! The single control loop: clock-aligned crawling plus the once-a-day
//! pipeline (aggregate, write artifacts, export, publish).
//!
//! The scheduler owns the reading store for its whole lifetime. Crawl and
//! pipeline failures are logged and the loop carries on; only a store
//! connection that cannot be re-established ends it.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::db::models::DailyRun;
use crate::db::store::{ReadingStore, StoreError};
use crate::models::lot::Lot;
use crate::services::aggregate::LookbackWindow;
use crate::services::clock::{in_grace_window, nap_duration, CrawlSlot};
use crate::services::crawl::{crawl_once, TrackedLot};
use crate::services::export::export_week;
use crate::services::heatmap::{GenerateError, HeatmapWriter};
use crate::services::publish::Publisher;
use crate::utils::LOCAL_TIMESTAMP_FORMAT;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub crawl_interval_minutes: u32,
    pub grace_minutes: u32,
    pub windows: Vec<LookbackWindow>,
    pub heatmap_dir: PathBuf,
    pub export_dir: PathBuf,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Crawling,
    RunningDailyPipeline,
}

#[derive(Debug)]
pub enum SchedulerError {
    /// The store connection was lost and every reconnect attempt failed.
    FatalStorageLoss(StoreError),
}

impl core::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedulerError::FatalStorageLoss(e) => write!(f, "reading store unavailable: {}", e),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// What one daily pipeline run produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DailyReport {
    pub artifacts: Vec<String>,
    pub export: Option<PathBuf>,
}

pub struct Scheduler<S, P> {
    store: S,
    publisher: P,
    lots: Vec<TrackedLot>,
    catalog: Vec<Lot>,
    tz: Tz,
    cfg: SchedulerConfig,
    phase: Phase,
    last_crawl: Option<CrawlSlot>,
    last_daily_run: Option<NaiveDate>,
}

impl<S: ReadingStore, P: Publisher> Scheduler<S, P> {
    pub fn new(store: S, publisher: P, lots: Vec<TrackedLot>, tz: Tz, cfg: SchedulerConfig) -> Self {
        let catalog = lots.iter().map(|t| t.lot.clone()).collect();
        Scheduler {
            store,
            publisher,
            lots,
            catalog,
            tz,
            cfg,
            phase: Phase::Idle,
            last_crawl: None,
            last_daily_run: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Evaluate the transition rules once for `now`.
    pub fn tick(&mut self, now: &DateTime<Tz>) -> Result<(), SchedulerError> {
        let slot = CrawlSlot::containing(now, self.cfg.crawl_interval_minutes);
        if self.last_crawl != Some(slot) {
            self.phase = Phase::Crawling;
            let report = crawl_once(&mut self.store, &self.lots, now);
            self.last_crawl = Some(slot);
            self.phase = Phase::Idle;

            if report.connection_lost() {
                self.recover_store(StoreError::Connection(format!(
                    "crawl at {} could not write",
                    now.format(LOCAL_TIMESTAMP_FORMAT)
                )))?;
            }
        }

        if in_grace_window(now, self.cfg.grace_minutes) {
            let today = now.date_naive();
            match self.daily_run_done(today) {
                Ok(true) => {}
                Ok(false) => {
                    self.phase = Phase::RunningDailyPipeline;
                    let outcome = self.run_daily_pipeline(now);
                    self.phase = Phase::Idle;
                    match outcome {
                        Ok(report) => info!(
                            "Daily pipeline for {} complete: {} artifact(s), export {}",
                            today,
                            report.artifacts.len(),
                            report
                                .export
                                .as_ref()
                                .map(|p| p.display().to_string())
                                .unwrap_or_else(|| "-".to_string())
                        ),
                        Err(GenerateError::Store(e)) if e.is_connection_loss() => self.recover_store(e)?,
                        Err(e) => error!("Daily pipeline for {} failed, will retry: {}", today, e),
                    }
                }
                Err(e) => self.recover_store(e)?,
            }
        }

        Ok(())
    }

    /// Whether today's pipeline already ran, consulting the persisted ledger
    /// first and the in-process marker when the ledger cannot be read.
    fn daily_run_done(&mut self, today: NaiveDate) -> Result<bool, StoreError> {
        if self.last_daily_run.is_some_and(|d| d >= today) {
            return Ok(true);
        }
        match self.store.last_daily_run() {
            Ok(Some(d)) if d >= today => {
                self.last_daily_run = Some(d);
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.is_connection_loss() => Err(e),
            Err(e) => {
                warn!("Daily-run ledger unavailable, using in-process marker only: {}", e);
                Ok(false)
            }
        }
    }

    /// Aggregate and write every window, record the day as done, then export
    /// and publish. Export and publish failures are logged only.
    pub fn run_daily_pipeline(&mut self, now: &DateTime<Tz>) -> Result<DailyReport, GenerateError> {
        let today = now.date_naive();
        info!("Daily pipeline for {} starting", today);

        let rows = self.store.row_count()?;
        let artifacts = if rows == 0 {
            info!("No readings stored yet; skipping heatmap generation");
            Vec::new()
        } else {
            info!("Aggregating {} reading(s)", rows);
            HeatmapWriter::new(&self.catalog, &self.cfg.windows, &self.cfg.heatmap_dir)
                .generate_all(&mut self.store, now)?
        };

        self.last_daily_run = Some(today);
        let run = DailyRun {
            run_date: today,
            completed_at: now.with_timezone(&Utc),
        };
        if let Err(e) = self.store.record_daily_run(&run) {
            warn!("Could not persist daily-run marker for {}: {}", today, e);
        }

        let export_day = today.pred_opt().unwrap_or(today);
        let export = match export_week(&mut self.store, &self.catalog, self.tz, export_day, &self.cfg.export_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("CSV export failed: {}", e);
                None
            }
        };

        if !artifacts.is_empty() {
            if let Err(e) = self.publisher.replace_artifacts(&self.cfg.heatmap_dir, &artifacts) {
                error!("Artifact upload failed: {}", e);
            }
        }
        let changed: Vec<PathBuf> = export.iter().cloned().collect();
        if let Err(e) = self.publisher.snapshot_and_push(&changed, today) {
            error!("Snapshot failed: {}", e);
        }

        Ok(DailyReport { artifacts, export })
    }

    fn recover_store(&mut self, cause: StoreError) -> Result<(), SchedulerError> {
        warn!("Reading store connection lost: {}", cause);
        let mut last = cause;
        for attempt in 1..=self.cfg.reconnect_attempts {
            match self.store.reconnect() {
                Ok(()) => {
                    info!("Reconnected to reading store (attempt {})", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Reconnect attempt {}/{} failed: {}",
                        attempt, self.cfg.reconnect_attempts, e
                    );
                    last = e;
                    if attempt < self.cfg.reconnect_attempts {
                        thread::sleep(self.cfg.reconnect_backoff);
                    }
                }
            }
        }
        Err(SchedulerError::FatalStorageLoss(last))
    }

    /// Tick until `stop` fires (or its sender is dropped), sleeping between
    /// ticks. The stop signal is only observed between ticks, so a running
    /// pipeline finishes first. The store is dropped, closing it, on return.
    pub fn run(mut self, stop: &Receiver<()>) -> Result<(), SchedulerError> {
        info!(
            "Scheduler started: {} lot(s), crawl every {} min, daily pipeline within {} min of midnight ({})",
            self.lots.len(),
            self.cfg.crawl_interval_minutes,
            self.cfg.grace_minutes,
            self.tz.name()
        );

        loop {
            let now = Utc::now().with_timezone(&self.tz);
            self.tick(&now)?;

            let nap = nap_duration(&Utc::now().with_timezone(&self.tz), self.cfg.crawl_interval_minutes);
            match stop.recv_timeout(nap) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        info!("Scheduler stopping; closing reading store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{SensorSource, SourceError};
    use crate::db::memory::MemoryStore;
    use crate::db::models::NewReading;
    use crate::models::lot::{default_catalog, LotId, Occupancy};
    use crate::services::aggregate::default_windows;
    use crate::services::publish::PublishError;
    use chrono::TimeZone;
    use chrono_tz::America::Chicago;
    use std::cell::{Cell, RefCell};
    use std::path::Path;
    use std::rc::Rc;
    use std::sync::mpsc;

    struct CountingSource {
        result: Result<Occupancy, u16>,
        calls: Rc<Cell<u32>>,
    }

    impl SensorSource for CountingSource {
        fn fetch(&self) -> Result<Occupancy, SourceError> {
            self.calls.set(self.calls.get() + 1);
            self.result.map_err(|status| SourceError::Http { status })
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        uploads: RefCell<Vec<Vec<String>>>,
        snapshots: RefCell<Vec<(Vec<PathBuf>, NaiveDate)>>,
    }

    impl Publisher for RecordingPublisher {
        fn replace_artifacts(&self, _dir: &Path, filenames: &[String]) -> Result<(), PublishError> {
            self.uploads.borrow_mut().push(filenames.to_vec());
            Ok(())
        }

        fn snapshot_and_push(&self, changed: &[PathBuf], run_date: NaiveDate) -> Result<(), PublishError> {
            self.snapshots.borrow_mut().push((changed.to_vec(), run_date));
            Ok(())
        }
    }

    struct Harness {
        scheduler: Scheduler<MemoryStore, RecordingPublisher>,
        calls: Rc<Cell<u32>>,
        dir: PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn config(dir: &Path) -> SchedulerConfig {
        SchedulerConfig {
            crawl_interval_minutes: 5,
            grace_minutes: 5,
            windows: default_windows(),
            heatmap_dir: dir.join("heatmaps"),
            export_dir: dir.join("data"),
            reconnect_attempts: 2,
            reconnect_backoff: Duration::ZERO,
        }
    }

    fn harness(tag: &str, store: MemoryStore, results: &[Result<Occupancy, u16>]) -> Harness {
        let dir = std::env::temp_dir().join(format!("parking-sched-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let calls = Rc::new(Cell::new(0));
        let lots = default_catalog()
            .into_iter()
            .zip(results)
            .map(|(lot, result)| TrackedLot {
                lot,
                source: Box::new(CountingSource {
                    result: *result,
                    calls: calls.clone(),
                }) as Box<dyn SensorSource>,
            })
            .collect();
        let scheduler = Scheduler::new(store, RecordingPublisher::default(), lots, Chicago, config(&dir));
        Harness { scheduler, calls, dir }
    }

    const OK: Result<Occupancy, u16> = Ok(Occupancy { occupied: 1, available: 1 });

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Tz> {
        Chicago.with_ymd_and_hms(2025, 6, d, h, m, s).unwrap()
    }

    fn seeded_store() -> MemoryStore {
        let mut store = MemoryStore::default();
        store.insert(NewReading::new(
            at(4, 12, 0, 0).with_timezone(&Utc),
            LotId(1),
            Occupancy { occupied: 3, available: 1 },
        ));
        store
    }

    #[test]
    fn crawls_at_most_once_per_interval() {
        let mut h = harness("interval", MemoryStore::default(), &[OK]);
        for (m, s) in [(0, 0), (0, 30), (2, 10), (4, 59)] {
            h.scheduler.tick(&at(5, 10, m, s)).unwrap();
        }
        assert_eq!(h.calls.get(), 1);

        h.scheduler.tick(&at(5, 10, 5, 0)).unwrap();
        h.scheduler.tick(&at(5, 10, 5, 40)).unwrap();
        assert_eq!(h.calls.get(), 2);
        assert_eq!(h.scheduler.store().readings().len(), 2);
        assert_eq!(h.scheduler.phase(), Phase::Idle);
    }

    #[test]
    fn same_slot_on_the_next_day_crawls_again() {
        let mut h = harness("nextday", MemoryStore::default(), &[OK]);
        h.scheduler.tick(&at(5, 10, 0, 0)).unwrap();
        h.scheduler.tick(&at(6, 10, 0, 0)).unwrap();
        assert_eq!(h.calls.get(), 2);
    }

    #[test]
    fn failing_lot_does_not_stop_the_loop() {
        let mut h = harness("partial", MemoryStore::default(), &[Err(500), OK]);
        h.scheduler.tick(&at(5, 10, 0, 0)).unwrap();
        assert_eq!(h.calls.get(), 2);
        let lots: Vec<_> = h.scheduler.store().readings().iter().map(|r| r.lot_id).collect();
        assert_eq!(lots, [2]);
    }

    #[test]
    fn daily_pipeline_runs_once_per_date() {
        let mut h = harness("daily", seeded_store(), &[OK]);
        h.scheduler.tick(&at(5, 0, 0, 10)).unwrap();
        h.scheduler.tick(&at(5, 0, 1, 0)).unwrap();
        h.scheduler.tick(&at(5, 0, 4, 30)).unwrap();

        let uploads = h.scheduler.publisher().uploads.borrow().clone();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].last().map(String::as_str), Some("meta.json"));
        assert_eq!(h.scheduler.store().daily_runs(), [at(5, 0, 0, 0).date_naive()]);
        assert!(h.dir.join("heatmaps").join("7d.json").is_file());

        let snapshots = h.scheduler.publisher().snapshots.borrow().clone();
        assert_eq!(snapshots.len(), 1);
        // Export covers the ISO week of the day that just ended.
        assert_eq!(snapshots[0].0, [h.dir.join("data").join("week_2025_23.csv")]);
    }

    #[test]
    fn restart_inside_grace_window_does_not_rerun() {
        let mut h = harness("restart", seeded_store(), &[OK]);
        h.scheduler.tick(&at(5, 0, 1, 0)).unwrap();
        assert_eq!(h.scheduler.publisher().uploads.borrow().len(), 1);

        let store = std::mem::replace(h.scheduler.store_mut(), MemoryStore::default());
        let mut restarted = harness("restart2", store, &[OK]);
        restarted.scheduler.tick(&at(5, 0, 2, 0)).unwrap();
        assert!(restarted.scheduler.publisher().uploads.borrow().is_empty());
        assert_eq!(restarted.scheduler.store().daily_runs().len(), 1);
    }

    #[test]
    fn unreadable_ledger_degrades_to_once_per_process() {
        let store = seeded_store().with_failing_ledger();
        let mut h = harness("ledger", store, &[OK]);
        h.scheduler.tick(&at(5, 0, 0, 30)).unwrap();
        h.scheduler.tick(&at(5, 0, 3, 0)).unwrap();
        assert_eq!(h.scheduler.publisher().uploads.borrow().len(), 1);
    }

    #[test]
    fn query_failure_retries_within_grace_window() {
        let store = seeded_store().with_failing_queries();
        let mut h = harness("retry", store, &[OK]);
        h.scheduler.tick(&at(5, 0, 0, 30)).unwrap();
        assert!(h.scheduler.publisher().uploads.borrow().is_empty());
        assert!(h.scheduler.store().daily_runs().is_empty());

        h.scheduler.store_mut().fail_queries = false;
        h.scheduler.tick(&at(5, 0, 2, 0)).unwrap();
        assert_eq!(h.scheduler.publisher().uploads.borrow().len(), 1);
        assert_eq!(h.scheduler.store().daily_runs().len(), 1);
    }

    #[test]
    fn empty_store_skips_generation_but_marks_the_day() {
        let mut h = harness("empty", MemoryStore::default(), &[Err(503)]);
        h.scheduler.tick(&at(5, 0, 0, 0)).unwrap();
        assert!(h.scheduler.publisher().uploads.borrow().is_empty());
        assert_eq!(h.scheduler.store().daily_runs().len(), 1);
        assert!(!h.dir.join("heatmaps").exists());
    }

    #[test]
    fn outside_grace_window_no_pipeline_runs() {
        let mut h = harness("noon", seeded_store(), &[OK]);
        h.scheduler.tick(&at(5, 0, 5, 0)).unwrap();
        h.scheduler.tick(&at(5, 12, 0, 0)).unwrap();
        assert!(h.scheduler.publisher().uploads.borrow().is_empty());
    }

    #[test]
    fn lost_connection_is_recovered() {
        let store = MemoryStore::disconnected(1);
        let mut h = harness("reconnect", store, &[OK]);
        h.scheduler.tick(&at(5, 10, 0, 0)).unwrap();
        assert_eq!(h.scheduler.store().reconnects, 2);
        assert!(!h.scheduler.store().disconnected);

        h.scheduler.tick(&at(5, 10, 5, 0)).unwrap();
        assert_eq!(h.scheduler.store().readings().len(), 1);
    }

    #[test]
    fn unrecoverable_connection_is_fatal() {
        let store = MemoryStore::disconnected(10);
        let mut h = harness("fatal", store, &[OK]);
        let err = h.scheduler.tick(&at(5, 10, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::FatalStorageLoss(StoreError::Connection(_))));
        assert_eq!(h.scheduler.store().reconnects, 2);
    }

    #[test]
    fn stop_signal_ends_the_loop() {
        let dir = std::env::temp_dir().join(format!("parking-sched-stop-{}", std::process::id()));
        let scheduler = Scheduler::new(
            MemoryStore::default(),
            RecordingPublisher::default(),
            Vec::new(),
            Chicago,
            config(&dir),
        );
        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();
        assert!(scheduler.run(&rx).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dropped_sender_ends_the_loop() {
        let dir = std::env::temp_dir().join(format!("parking-sched-drop-{}", std::process::id()));
        let scheduler = Scheduler::new(
            MemoryStore::default(),
            RecordingPublisher::default(),
            Vec::new(),
            Chicago,
            config(&dir),
        );
        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        assert!(scheduler.run(&rx).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
