//! Diesel model structs for stored readings and the daily-run ledger.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::lot::{LotId, Occupancy};
use crate::schema;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::parking_readings)]
pub struct Reading {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub lot_id: i32,
    pub occupied_spots: i32,
    pub available_spots: i32,
}

impl Reading {
    pub fn lot(&self) -> LotId {
        LotId(self.lot_id)
    }

    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            occupied: self.occupied_spots,
            available: self.available_spots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::parking_readings)]
pub struct NewReading {
    pub time: DateTime<Utc>,
    pub lot_id: i32,
    pub occupied_spots: i32,
    pub available_spots: i32,
}

impl NewReading {
    pub fn new(time: DateTime<Utc>, lot: LotId, occupancy: Occupancy) -> Self {
        Self {
            time,
            lot_id: lot.0,
            occupied_spots: occupancy.occupied,
            available_spots: occupancy.available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Insertable)]
#[diesel(table_name = schema::daily_runs)]
#[diesel(primary_key(run_date))]
pub struct DailyRun {
    pub run_date: NaiveDate,
    pub completed_at: DateTime<Utc>,
}
