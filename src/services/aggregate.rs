//! Time-bucketed aggregation of raw readings into per-lot 7×288 matrices.
//!
//! A reading lands in exactly one bucket `(lot, day_of_week, slot)`, with the
//! day and the 5-minute slot evaluated in the configured local zone. Each
//! bucket holds the mean occupancy rate (one decimal) and the number of
//! readings that contributed to it. Readings from an empty pool (capacity 0)
//! count towards the queried date range but never towards a bucket.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use log::debug;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;

use crate::db::models::Reading;
use crate::db::store::{ReadingStore, StoreError};
use crate::models::lot::{Lot, LotId};
use crate::utils::{day_of_week, round_one_decimal, time_slot, DAYS_PER_WEEK, SLOTS_PER_DAY};

/// Trailing span of history an aggregation looks at.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LookbackWindow {
    Bounded(NonZeroU32),
    Unbounded,
}

impl LookbackWindow {
    pub fn days(self) -> Option<u32> {
        match self {
            LookbackWindow::Bounded(days) => Some(days.get()),
            LookbackWindow::Unbounded => None,
        }
    }

    /// Earliest instant a reading may have to qualify.
    pub fn cutoff(self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.days().map(|d| reference - Duration::days(i64::from(d)))
    }

    pub fn artifact_filename(self) -> String {
        format!("{}.json", self)
    }
}

impl Display for LookbackWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LookbackWindow::Bounded(days) => write!(f, "{}d", days),
            LookbackWindow::Unbounded => write!(f, "all"),
        }
    }
}

impl FromStr for LookbackWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") || trimmed.eq_ignore_ascii_case("unbounded") {
            return Ok(LookbackWindow::Unbounded);
        }
        let digits = trimmed.strip_suffix('d').unwrap_or(trimmed);
        digits
            .parse::<NonZeroU32>()
            .map(LookbackWindow::Bounded)
            .map_err(|_| format!("invalid lookback window '{}': expected a positive day count or 'all'", s))
    }
}

pub fn default_windows() -> Vec<LookbackWindow> {
    let mut windows: Vec<_> = [7, 30, 90, 120]
        .into_iter()
        .filter_map(NonZeroU32::new)
        .map(LookbackWindow::Bounded)
        .collect();
    windows.push(LookbackWindow::Unbounded);
    windows
}

/// Inclusive local calendar dates spanned by the queried readings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateRange {
    fn widen(range: Option<DateRange>, date: NaiveDate) -> DateRange {
        match range {
            None => DateRange { first: date, last: date },
            Some(r) => DateRange {
                first: r.first.min(date),
                last: r.last.max(date),
            },
        }
    }
}

/// One aggregated bucket as produced by a reading store.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub lot: LotId,
    pub day_of_week: u32,
    pub slot: u32,
    pub avg_occupancy: Option<f64>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregatedRows {
    /// Sorted by `(lot, day_of_week, slot)`.
    pub rows: Vec<BucketRow>,
    pub range: Option<DateRange>,
}

/// Bucket readings in memory. Mirrors the store-side SQL aggregation.
pub fn bucket_readings<'a, I>(readings: I, cutoff: Option<DateTime<Utc>>, tz: Tz) -> AggregatedRows
where
    I: IntoIterator<Item = &'a Reading>,
{
    let mut range = None;
    let mut buckets: BTreeMap<(LotId, u32, u32), Vec<f64>> = BTreeMap::new();

    for reading in readings {
        if cutoff.is_some_and(|c| reading.time < c) {
            continue;
        }
        let local = reading.time.with_timezone(&tz);
        range = Some(DateRange::widen(range, local.date_naive()));

        let rates = buckets
            .entry((reading.lot(), day_of_week(&local), time_slot(&local)))
            .or_default();
        if let Some(rate) = reading.occupancy().rate() {
            rates.push(rate);
        }
    }

    let rows = buckets
        .into_iter()
        .map(|((lot, day, slot), mut rates)| {
            // Summation order is fixed so the mean does not depend on input order.
            rates.sort_by(f64::total_cmp);
            let avg_occupancy = if rates.is_empty() {
                None
            } else {
                Some(round_one_decimal(rates.iter().sum::<f64>() / rates.len() as f64))
            };
            BucketRow {
                lot,
                day_of_week: day,
                slot,
                avg_occupancy,
                sample_count: rates.len() as u32,
            }
        })
        .collect();

    AggregatedRows { rows, range }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct HeatmapCell {
    pub avg_occupancy: Option<f64>,
    pub sample_count: u32,
}

impl HeatmapCell {
    pub const EMPTY: HeatmapCell = HeatmapCell {
        avg_occupancy: None,
        sample_count: 0,
    };

    /// Keeps `sample_count == 0` and `avg_occupancy == None` in lockstep.
    pub fn new(avg_occupancy: Option<f64>, sample_count: u32) -> Self {
        match avg_occupancy {
            Some(avg) if sample_count > 0 => HeatmapCell {
                avg_occupancy: Some(avg),
                sample_count,
            },
            _ => HeatmapCell::EMPTY,
        }
    }
}

/// Per-lot grid indexed `[day_of_week][slot]`, Sunday first, slot 0 at local midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    cells: Vec<HeatmapCell>,
}

impl Default for Matrix {
    fn default() -> Self {
        Matrix {
            cells: vec![HeatmapCell::EMPTY; DAYS_PER_WEEK * SLOTS_PER_DAY],
        }
    }
}

impl Matrix {
    /// Returns false when the coordinates fall outside the grid.
    pub fn set(&mut self, day: usize, slot: usize, cell: HeatmapCell) -> bool {
        if day < DAYS_PER_WEEK && slot < SLOTS_PER_DAY {
            self.cells[day * SLOTS_PER_DAY + slot] = cell;
            true
        } else {
            false
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[HeatmapCell]> {
        self.cells.chunks(SLOTS_PER_DAY)
    }

    pub fn cells(&self) -> impl Iterator<Item = &HeatmapCell> {
        self.cells.iter()
    }

    pub fn occupancy_projection(&self) -> Vec<Vec<Option<f64>>> {
        self.rows()
            .map(|row| row.iter().map(|c| c.avg_occupancy).collect())
            .collect()
    }

    pub fn sample_count_projection(&self) -> Vec<Vec<u32>> {
        self.rows()
            .map(|row| row.iter().map(|c| c.sample_count).collect())
            .collect()
    }

    /// Rebuild a matrix from its two projections; `None` if either is not 7×288.
    pub fn from_projections(occupancy: &[Vec<Option<f64>>], counts: &[Vec<u32>]) -> Option<Matrix> {
        if occupancy.len() != DAYS_PER_WEEK || counts.len() != DAYS_PER_WEEK {
            return None;
        }
        let mut cells = Vec::with_capacity(DAYS_PER_WEEK * SLOTS_PER_DAY);
        for (avg_row, count_row) in occupancy.iter().zip(counts) {
            if avg_row.len() != SLOTS_PER_DAY || count_row.len() != SLOTS_PER_DAY {
                return None;
            }
            cells.extend(
                avg_row
                    .iter()
                    .zip(count_row)
                    .map(|(avg, count)| HeatmapCell::new(*avg, *count)),
            );
        }
        Some(Matrix { cells })
    }
}

/// Result of one aggregation run, keyed by lot name.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub matrices: BTreeMap<String, Matrix>,
    pub range: Option<DateRange>,
}

pub struct AggregationEngine<'a> {
    lots: &'a [Lot],
    tz: Tz,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(lots: &'a [Lot], tz: Tz) -> Self {
        AggregationEngine { lots, tz }
    }

    pub fn aggregate<S: ReadingStore + ?Sized>(
        &self,
        store: &mut S,
        window: LookbackWindow,
        reference: DateTime<Utc>,
    ) -> Result<Aggregation, StoreError> {
        let rows = store.query_aggregated(window.cutoff(reference), self.tz)?;
        debug!(
            "Aggregate: window {} produced {} bucket row(s)",
            window,
            rows.rows.len()
        );
        Ok(self.assemble(rows))
    }

    /// Every catalog lot gets a matrix, even without readings. Rows for lots
    /// outside the catalog are dropped.
    pub fn assemble(&self, aggregated: AggregatedRows) -> Aggregation {
        let mut by_id: BTreeMap<LotId, Matrix> =
            self.lots.iter().map(|l| (l.id, Matrix::default())).collect();

        for row in aggregated.rows {
            let Some(matrix) = by_id.get_mut(&row.lot) else {
                debug!("Aggregate: ignoring bucket for unknown lot {}", row.lot.0);
                continue;
            };
            let cell = HeatmapCell::new(row.avg_occupancy, row.sample_count);
            if !matrix.set(row.day_of_week as usize, row.slot as usize, cell) {
                debug!(
                    "Aggregate: ignoring out-of-grid bucket (lot {}, day {}, slot {})",
                    row.lot.0, row.day_of_week, row.slot
                );
            }
        }

        let matrices = self
            .lots
            .iter()
            .filter_map(|lot| by_id.remove(&lot.id).map(|m| (lot.name.clone(), m)))
            .collect();

        Aggregation {
            matrices,
            range: aggregated.range,
        }
    }
}
