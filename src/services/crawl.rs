use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};

use crate::client::{SensorSource, SourceError};
use crate::db::models::NewReading;
use crate::db::store::{ReadingStore, StoreError};
use crate::models::lot::Lot;
use crate::utils::truncate_to_minute;

/// A catalog lot paired with the feed that samples it.
pub struct TrackedLot {
    pub lot: Lot,
    pub source: Box<dyn SensorSource>,
}

#[derive(Debug)]
pub enum LotOutcome {
    Stored { occupied: i32, available: i32 },
    SourceUnavailable(SourceError),
    WriteFailed(StoreError),
}

#[derive(Debug)]
pub struct CrawlReport {
    pub time: DateTime<Utc>,
    pub outcomes: Vec<(String, LotOutcome)>,
}

impl CrawlReport {
    pub fn stored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, LotOutcome::Stored { .. }))
            .count()
    }

    pub fn any_stored(&self) -> bool {
        self.stored() > 0
    }

    /// True when a write failed because the store connection is gone.
    pub fn connection_lost(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, o)| matches!(o, LotOutcome::WriteFailed(e) if e.is_connection_loss()))
    }
}

/// Sample every tracked lot once and append what could be fetched.
///
/// Each lot is isolated: a failed fetch or write is logged and the remaining
/// lots are still processed. There are no retries; the next interval is the retry.
pub fn crawl_once<S, Tz>(store: &mut S, lots: &[TrackedLot], now: &DateTime<Tz>) -> CrawlReport
where
    S: ReadingStore + ?Sized,
    Tz: TimeZone,
{
    let time = truncate_to_minute(now).with_timezone(&Utc);
    let mut outcomes = Vec::with_capacity(lots.len());

    for tracked in lots {
        let name = tracked.lot.name.clone();
        let occupancy = match tracked.source.fetch() {
            Ok(o) => o,
            Err(e) => {
                warn!("Crawl: {} skipped this interval: {}", name, e);
                outcomes.push((name, LotOutcome::SourceUnavailable(e)));
                continue;
            }
        };

        let reading = NewReading::new(time, tracked.lot.id, occupancy);
        match store.append(&reading) {
            Ok(()) => {
                debug!(
                    "Crawl: {} occupied={}/{} ({})",
                    name,
                    occupancy.occupied,
                    occupancy.capacity(),
                    occupancy
                        .rate()
                        .map(|r| format!("{:.1}%", r))
                        .unwrap_or_else(|| "empty pool".to_string())
                );
                outcomes.push((
                    name,
                    LotOutcome::Stored {
                        occupied: occupancy.occupied,
                        available: occupancy.available,
                    },
                ));
            }
            Err(e) => {
                warn!("Crawl: sample for {} lost: {}", name, e);
                outcomes.push((name, LotOutcome::WriteFailed(e)));
            }
        }
    }

    let report = CrawlReport { time, outcomes };
    info!(
        "Crawl at {}: stored {}/{} lot(s)",
        now.naive_local().format("%Y-%m-%d %H:%M"),
        report.stored(),
        lots.len()
    );
    report
}
