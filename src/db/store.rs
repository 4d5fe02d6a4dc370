//! Append-only reading store.
//!
//! The Postgres implementation owns a single long-lived connection; callers
//! borrow the store mutably for the duration of each operation. Aggregation
//! runs as one parameterized statement, so the lookback cutoff and the local
//! zone are bound values rather than spliced SQL.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Date, Double, Integer, Nullable, Text, Timestamptz};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

use crate::db::models::{DailyRun, NewReading, Reading};
use crate::models::lot::LotId;
use crate::schema;
use crate::services::aggregate::{AggregatedRows, BucketRow, DateRange};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug)]
pub enum StoreError {
    /// The connection is gone; nothing else can succeed until it is re-established.
    Connection(String),
    Write(String),
    Query(String),
}

impl StoreError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Connection(s) => write!(f, "store connection lost: {}", s),
            StoreError::Write(s) => write!(f, "store write failed: {}", s),
            StoreError::Query(s) => write!(f, "store query failed: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait ReadingStore {
    fn append(&mut self, reading: &NewReading) -> Result<(), StoreError>;

    fn append_batch(&mut self, readings: &[NewReading]) -> Result<usize, StoreError>;

    /// Bucket every reading at or after `cutoff` (all readings when `None`),
    /// evaluating day of week and slot in `tz`.
    fn query_aggregated(&mut self, cutoff: Option<DateTime<Utc>>, tz: Tz) -> Result<AggregatedRows, StoreError>;

    fn row_count(&mut self) -> Result<i64, StoreError>;

    /// Readings with `from <= time < to`, ordered by time then lot.
    fn readings_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>, StoreError>;

    fn last_daily_run(&mut self) -> Result<Option<NaiveDate>, StoreError>;

    fn record_daily_run(&mut self, run: &DailyRun) -> Result<(), StoreError>;

    fn reconnect(&mut self) -> Result<(), StoreError>;
}

pub struct PgStore {
    conn: PgConnection,
    url: String,
}

const AGGREGATE_SQL: &str = "
    SELECT
        lot_id,
        EXTRACT(DOW FROM time AT TIME ZONE $2)::int4 AS day_of_week,
        FLOOR((EXTRACT(HOUR FROM time AT TIME ZONE $2) * 60
               + EXTRACT(MINUTE FROM time AT TIME ZONE $2)) / 5)::int4 AS slot,
        ROUND(AVG(occupied_spots::float8
                  / NULLIF(occupied_spots::int8 + available_spots::int8, 0)::float8 * 100.0)::numeric, 1)::float8
            AS avg_occupancy,
        COUNT(*) FILTER (WHERE occupied_spots::int8 + available_spots::int8 > 0) AS sample_count
    FROM parking_readings
    WHERE $1::timestamptz IS NULL OR time >= $1::timestamptz
    GROUP BY lot_id, day_of_week, slot
    ORDER BY lot_id, day_of_week, slot";

const DATE_RANGE_SQL: &str = "
    SELECT
        MIN((time AT TIME ZONE $2)::date) AS first_day,
        MAX((time AT TIME ZONE $2)::date) AS last_day
    FROM parking_readings
    WHERE $1::timestamptz IS NULL OR time >= $1::timestamptz";

#[derive(QueryableByName)]
struct BucketRecord {
    #[diesel(sql_type = Integer)]
    lot_id: i32,
    #[diesel(sql_type = Integer)]
    day_of_week: i32,
    #[diesel(sql_type = Integer)]
    slot: i32,
    #[diesel(sql_type = Nullable<Double>)]
    avg_occupancy: Option<f64>,
    #[diesel(sql_type = BigInt)]
    sample_count: i64,
}

#[derive(QueryableByName)]
struct DayRangeRecord {
    #[diesel(sql_type = Nullable<Date>)]
    first_day: Option<NaiveDate>,
    #[diesel(sql_type = Nullable<Date>)]
    last_day: Option<NaiveDate>,
}

/// Map a diesel error onto the store taxonomy; lost connections are singled
/// out so the scheduler can try to re-establish them.
fn classify(err: DieselError, what: &str, otherwise: fn(String) -> StoreError) -> StoreError {
    let message = format!("{}: {}", what, err);
    match &err {
        DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) | DieselError::BrokenTransactionManager => {
            StoreError::Connection(message)
        }
        DieselError::DatabaseError(_, info)
            if info.message().contains("server closed the connection")
                || info.message().contains("no connection to the server") =>
        {
            StoreError::Connection(message)
        }
        _ => otherwise(message),
    }
}

impl PgStore {
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let conn = PgConnection::establish(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(PgStore {
            conn,
            url: url.to_string(),
        })
    }

    pub fn apply_migrations(&mut self) -> Result<(), String> {
        match self.conn.run_pending_migrations(MIGRATIONS) {
            Ok(applied) => {
                if applied.is_empty() {
                    info!("Database schema is up to date; no migrations were applied");
                } else {
                    let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                    info!("Applied {} database migration(s): {}", applied.len(), names);
                }
                Ok(())
            }
            Err(e) => Err(format!("Applying database migrations failed: {}", e)),
        }
    }

    pub fn server_version(&mut self) -> Result<String, StoreError> {
        #[derive(QueryableByName)]
        struct Version {
            #[diesel(sql_type = Text)]
            version: String,
        }
        diesel::sql_query("SELECT version() AS version")
            .get_result::<Version>(&mut self.conn)
            .map(|v| v.version)
            .map_err(|e| classify(e, "select version", StoreError::Query))
    }
}

impl ReadingStore for PgStore {
    fn append(&mut self, reading: &NewReading) -> Result<(), StoreError> {
        use schema::parking_readings::dsl as R;

        diesel::insert_into(R::parking_readings)
            .values(reading)
            .execute(&mut self.conn)
            .map(|_| ())
            .map_err(|e| classify(e, "insert reading", StoreError::Write))
    }

    fn append_batch(&mut self, readings: &[NewReading]) -> Result<usize, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }

        use schema::parking_readings::dsl as R;

        diesel::insert_into(R::parking_readings)
            .values(readings)
            .execute(&mut self.conn)
            .map_err(|e| classify(e, "insert reading batch", StoreError::Write))
    }

    fn query_aggregated(&mut self, cutoff: Option<DateTime<Utc>>, tz: Tz) -> Result<AggregatedRows, StoreError> {
        let range: DayRangeRecord = diesel::sql_query(DATE_RANGE_SQL)
            .bind::<Nullable<Timestamptz>, _>(cutoff)
            .bind::<Text, _>(tz.name())
            .get_result(&mut self.conn)
            .map_err(|e| classify(e, "query date range", StoreError::Query))?;

        let records: Vec<BucketRecord> = diesel::sql_query(AGGREGATE_SQL)
            .bind::<Nullable<Timestamptz>, _>(cutoff)
            .bind::<Text, _>(tz.name())
            .load(&mut self.conn)
            .map_err(|e| classify(e, "query aggregated buckets", StoreError::Query))?;

        let rows = records
            .into_iter()
            .map(|r| BucketRow {
                lot: LotId(r.lot_id),
                day_of_week: r.day_of_week.max(0) as u32,
                slot: r.slot.max(0) as u32,
                avg_occupancy: r.avg_occupancy,
                sample_count: r.sample_count.clamp(0, i64::from(u32::MAX)) as u32,
            })
            .collect();

        let range = match (range.first_day, range.last_day) {
            (Some(first), Some(last)) => Some(DateRange { first, last }),
            _ => None,
        };

        Ok(AggregatedRows { rows, range })
    }

    fn row_count(&mut self) -> Result<i64, StoreError> {
        use schema::parking_readings::dsl as R;

        R::parking_readings
            .count()
            .get_result(&mut self.conn)
            .map_err(|e| classify(e, "count readings", StoreError::Query))
    }

    fn readings_between(&mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reading>, StoreError> {
        use schema::parking_readings::dsl as R;

        R::parking_readings
            .filter(R::time.ge(from).and(R::time.lt(to)))
            .order((R::time.asc(), R::lot_id.asc()))
            .select(Reading::as_select())
            .load(&mut self.conn)
            .map_err(|e| classify(e, "query readings", StoreError::Query))
    }

    fn last_daily_run(&mut self) -> Result<Option<NaiveDate>, StoreError> {
        use schema::daily_runs::dsl as D;

        D::daily_runs
            .select(max(D::run_date))
            .first(&mut self.conn)
            .map_err(|e| classify(e, "query last daily run", StoreError::Query))
    }

    fn record_daily_run(&mut self, run: &DailyRun) -> Result<(), StoreError> {
        use schema::daily_runs::dsl as D;

        diesel::insert_into(D::daily_runs)
            .values(run)
            .on_conflict(D::run_date)
            .do_update()
            .set(D::completed_at.eq(run.completed_at))
            .execute(&mut self.conn)
            .map(|_| ())
            .map_err(|e| classify(e, "record daily run", StoreError::Write))
    }

    fn reconnect(&mut self) -> Result<(), StoreError> {
        self.conn = PgConnection::establish(&self.url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }
}
