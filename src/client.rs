//! Blocking HTTP client for the fopark lot occupancy endpoint.
//!
//! - Uses `ureq` with a global per-request timeout so a stalled vendor call
//!   cannot hold up the crawl tick.
//! - Payloads are decoded through `serde_path_to_error` so malformed bodies
//!   are reported with the offending JSON path.

use std::time::Duration;

use crate::models::fopark::OccupancyResponse;
use crate::models::lot::{Lot, Occupancy, SpotSelector};

const USER_AGENT: &str = concat!("parking-heatmaps/", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
pub enum SourceError {
    Transport(String),
    Timeout(String),
    Http { status: u16 },
    Json(serde_path_to_error::Error<serde_json::Error>),
    Body(String),
}

impl core::fmt::Display for SourceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SourceError::Transport(s) => write!(f, "transport error: {}", s),
            SourceError::Timeout(s) => write!(f, "timed out: {}", s),
            SourceError::Http { status } => write!(f, "http {}", status),
            SourceError::Json(e) => write!(f, "malformed payload at {}: {}", e.path(), e.inner()),
            SourceError::Body(s) => write!(f, "unreadable body: {}", s),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<ureq::Error> for SourceError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::StatusCode(status) => SourceError::Http { status },
            ureq::Error::Timeout(t) => SourceError::Timeout(t.to_string()),
            other => SourceError::Transport(other.to_string()),
        }
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for SourceError {
    fn from(value: serde_path_to_error::Error<serde_json::Error>) -> Self {
        SourceError::Json(value)
    }
}

/// Per-lot occupancy feed.
pub trait SensorSource {
    fn fetch(&self) -> Result<Occupancy, SourceError>;
}

#[derive(Clone)]
pub struct FoparkClient {
    agent: ureq::Agent,
}

impl FoparkClient {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        FoparkClient { agent }
    }

    pub fn get_occupancy(&self, url: &str) -> Result<OccupancyResponse, SourceError> {
        let mut res = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .call()?;
        let body = res
            .body_mut()
            .read_to_string()
            .map_err(|e| SourceError::Body(e.to_string()))?;
        parse_occupancy(&body)
    }

    /// Sensor source bound to one lot's endpoint and spot selection.
    pub fn source_for(&self, lot: &Lot) -> FoparkSource {
        FoparkSource {
            client: self.clone(),
            url: lot.source.url.clone(),
            selector: lot.source.selector.clone(),
        }
    }
}

pub fn parse_occupancy(body: &str) -> Result<OccupancyResponse, SourceError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    Ok(serde_path_to_error::deserialize(de)?)
}

pub struct FoparkSource {
    client: FoparkClient,
    url: String,
    selector: SpotSelector,
}

impl SensorSource for FoparkSource {
    fn fetch(&self) -> Result<Occupancy, SourceError> {
        let resp = self.client.get_occupancy(&self.url)?;
        Ok(self.selector.count(&resp.lot_status))
    }
}
