//! Payload of the fopark `lot/occupancy` endpoint.
//!
//! Only the fields the crawler reads are modeled; everything else in the
//! vendor response is ignored during deserialization.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyResponse {
    pub lot_status: Vec<SpotStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotStatus {
    /// 1 = occupied, 0 = free; other values mean the sensor has no verdict.
    pub status: i64,
    /// "lat,lon" of the stall sensor.
    #[serde(default)]
    pub coords: Option<String>,
}
