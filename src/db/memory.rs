//! In-process reading store used by the test suites.
//!
//! Aggregation goes through the same bucketing as the Postgres query mirrors,
//! and a handful of switches let tests simulate outages.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

use crate::db::models::{DailyRun, NewReading, Reading};
use crate::db::store::{ReadingStore, StoreError};
use crate::services::aggregate::{bucket_readings, AggregatedRows};

#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Vec<Reading>,
    next_id: i64,
    daily_runs: BTreeMap<NaiveDate, DateTime<Utc>>,

    /// Every operation fails with a connection error while set.
    pub disconnected: bool,
    /// Number of upcoming `reconnect` calls that fail before one succeeds.
    pub failing_reconnects: u32,
    pub fail_queries: bool,
    pub fail_ledger: bool,
    pub reconnects: u32,
}

impl MemoryStore {
    /// Starts out with a dead connection; `reconnect` revives it after
    /// `failing_reconnects` failed attempts.
    pub fn disconnected(failing_reconnects: u32) -> Self {
        MemoryStore {
            disconnected: true,
            failing_reconnects,
            ..MemoryStore::default()
        }
    }

    pub fn with_failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    pub fn with_failing_ledger(mut self) -> Self {
        self.fail_ledger = true;
        self
    }

    pub fn insert(&mut self, reading: NewReading) -> i64 {
        self.next_id += 1;
        self.readings.push(Reading {
            id: self.next_id,
            time: reading.time,
            lot_id: reading.lot_id,
            occupied_spots: reading.occupied_spots,
            available_spots: reading.available_spots,
        });
        self.next_id
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn daily_runs(&self) -> Vec<NaiveDate> {
        self.daily_runs.keys().copied().collect()
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        if self.disconnected {
            Err(StoreError::Connection("server closed the connection unexpectedly".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ReadingStore for MemoryStore {
    fn append(&mut self, reading: &NewReading) -> Result<(), StoreError> {
        self.check_connected()?;
        if reading.occupied_spots < 0 || reading.available_spots < 0 {
            return Err(StoreError::Write("spot counts must be non-negative".to_string()));
        }
        self.insert(reading.clone());
        Ok(())
    }

    fn append_batch(&mut self, readings: &[NewReading]) -> Result<usize, StoreError> {
        self.check_connected()?;
        if readings.iter().any(|r| r.occupied_spots < 0 || r.available_spots < 0) {
            return Err(StoreError::Write("spot counts must be non-negative".to_string()));
        }
        for r in readings {
            self.insert(r.clone());
        }
        Ok(readings.len())
    }

    fn query_aggregated(&mut self, cutoff: Option<DateTime<Utc>>, tz: Tz) -> Result<AggregatedRows, StoreError> {
        self.check_connected()?;
        if self.fail_queries {
            return Err(StoreError::Query("simulated query failure".to_string()));
        }
        Ok(bucket_readings(&self.readings, cutoff, tz))
    }

    fn row_count(&mut self) -> Result<i64, StoreError> {
        self.check_connected()?;
        Ok(self.readings.len() as i64)
    }

    fn readings_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>, StoreError> {
        self.check_connected()?;
        let mut out: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| r.time >= from && r.time < to)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.time, r.lot_id));
        Ok(out)
    }

    fn last_daily_run(&mut self) -> Result<Option<NaiveDate>, StoreError> {
        self.check_connected()?;
        if self.fail_ledger {
            return Err(StoreError::Query("simulated ledger failure".to_string()));
        }
        Ok(self.daily_runs.keys().next_back().copied())
    }

    fn record_daily_run(&mut self, run: &DailyRun) -> Result<(), StoreError> {
        self.check_connected()?;
        if self.fail_ledger {
            return Err(StoreError::Write("simulated ledger failure".to_string()));
        }
        self.daily_runs.insert(run.run_date, run.completed_at);
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        self.reconnects += 1;
        if self.failing_reconnects > 0 {
            self.failing_reconnects -= 1;
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        self.disconnected = false;
        Ok(())
    }
}
