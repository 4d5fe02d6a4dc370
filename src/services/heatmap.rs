//! Heatmap artifacts: the JSON shape consumed by the dashboard, and the
//! writer that regenerates one artifact per lookback window plus `meta.json`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::db::store::{ReadingStore, StoreError};
use crate::models::lot::Lot;
use crate::services::aggregate::{Aggregation, AggregationEngine, LookbackWindow, Matrix};
use crate::utils::{write_atomically, LOCAL_TIMESTAMP_FORMAT, SLOTS_PER_DAY, SLOT_MINUTES};

pub const META_FILENAME: &str = "meta.json";
pub const DAY_LABELS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
pub const METRIC: &str = "occupancy_rate";
pub const UNIT: &str = "percent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeLabel {
    /// `YYYY-MM-DD`, or empty when the window held no readings.
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapMeta {
    #[serde(rename = "yLabels")]
    pub y_labels: Vec<String>,
    #[serde(rename = "xLabels")]
    pub x_labels: Vec<String>,
    pub metric: String,
    pub unit: String,
    pub generated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapArtifact {
    pub range: RangeLabel,
    pub lots: BTreeMap<String, Vec<Vec<Option<f64>>>>,
    pub sample_counts: BTreeMap<String, Vec<Vec<u32>>>,
    pub meta: HeatmapMeta,
}

/// Companion summary listing what the last daily run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub last_updated: String,
    pub files: Vec<String>,
    pub lots: Vec<String>,
}

/// `"HH:MM~HH:MM"` for each 5-minute slot, the end being the slot's last minute.
pub fn slot_labels() -> Vec<String> {
    (0..SLOTS_PER_DAY as u32)
        .map(|slot| {
            let start = slot * SLOT_MINUTES;
            let end = start + SLOT_MINUTES - 1;
            format!("{:02}:{:02}~{:02}:{:02}", start / 60, start % 60, end / 60, end % 60)
        })
        .collect()
}

pub fn build(aggregation: &Aggregation, reference: &DateTime<Tz>) -> HeatmapArtifact {
    let range = match aggregation.range {
        Some(r) => RangeLabel {
            from: r.first.format("%Y-%m-%d").to_string(),
            to: r.last.format("%Y-%m-%d").to_string(),
        },
        None => RangeLabel {
            from: String::new(),
            to: String::new(),
        },
    };

    HeatmapArtifact {
        range,
        lots: aggregation
            .matrices
            .iter()
            .map(|(name, m)| (name.clone(), m.occupancy_projection()))
            .collect(),
        sample_counts: aggregation
            .matrices
            .iter()
            .map(|(name, m)| (name.clone(), m.sample_count_projection()))
            .collect(),
        meta: HeatmapMeta {
            y_labels: DAY_LABELS.iter().map(|d| d.to_string()).collect(),
            x_labels: slot_labels(),
            metric: METRIC.to_string(),
            unit: UNIT.to_string(),
            generated_at: reference.format(LOCAL_TIMESTAMP_FORMAT).to_string(),
        },
    }
}

impl HeatmapArtifact {
    /// Recombine the two projections per lot. `None` if any lot is missing
    /// from either projection or has the wrong shape.
    pub fn matrices(&self) -> Option<BTreeMap<String, Matrix>> {
        if self.lots.len() != self.sample_counts.len() {
            return None;
        }
        self.lots
            .iter()
            .map(|(name, occupancy)| {
                let counts = self.sample_counts.get(name)?;
                Some((name.clone(), Matrix::from_projections(occupancy, counts)?))
            })
            .collect()
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    write_atomically(path, |w| serde_json::to_writer_pretty(w, value).map_err(io::Error::from))
}

#[derive(Debug)]
pub enum GenerateError {
    Store(StoreError),
    Io { path: PathBuf, source: io::Error },
}

impl core::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GenerateError::Store(e) => write!(f, "{}", e),
            GenerateError::Io { path, source } => write!(f, "writing {} failed: {}", path.display(), source),
        }
    }
}

impl std::error::Error for GenerateError {}

impl From<StoreError> for GenerateError {
    fn from(value: StoreError) -> Self {
        GenerateError::Store(value)
    }
}

pub struct HeatmapWriter<'a> {
    lots: &'a [Lot],
    windows: &'a [LookbackWindow],
    out_dir: &'a Path,
}

impl<'a> HeatmapWriter<'a> {
    pub fn new(lots: &'a [Lot], windows: &'a [LookbackWindow], out_dir: &'a Path) -> Self {
        HeatmapWriter { lots, windows, out_dir }
    }

    /// Regenerate every window artifact and then the index. Returns the
    /// written filenames (index last) relative to the output directory.
    ///
    /// Nothing is written unless every window aggregated successfully.
    pub fn generate_all<S: ReadingStore + ?Sized>(
        &self,
        store: &mut S,
        reference: &DateTime<Tz>,
    ) -> Result<Vec<String>, GenerateError> {
        let engine = AggregationEngine::new(self.lots, reference.timezone());
        let reference_utc = reference.with_timezone(&Utc);

        let mut artifacts = Vec::with_capacity(self.windows.len());
        for window in self.windows {
            let aggregation = engine.aggregate(store, *window, reference_utc)?;
            match aggregation.range {
                Some(r) => info!("Heatmap {}: range {} to {}", window, r.first, r.last),
                None => info!("Heatmap {}: no readings in range", window),
            }
            artifacts.push((window.artifact_filename(), build(&aggregation, reference)));
        }

        fs::create_dir_all(self.out_dir).map_err(|source| GenerateError::Io {
            path: self.out_dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::with_capacity(artifacts.len() + 1);
        for (filename, artifact) in &artifacts {
            let path = self.out_dir.join(filename);
            write_json(&path, artifact).map_err(|source| GenerateError::Io { path: path.clone(), source })?;
            debug!("Heatmap: wrote {}", path.display());
            files.push(filename.clone());
        }

        let index = ArtifactIndex {
            last_updated: reference.format(LOCAL_TIMESTAMP_FORMAT).to_string(),
            files: files.clone(),
            lots: self.lots.iter().map(|l| l.name.clone()).collect(),
        };
        let index_path = self.out_dir.join(META_FILENAME);
        write_json(&index_path, &index).map_err(|source| GenerateError::Io {
            path: index_path.clone(),
            source,
        })?;
        files.push(META_FILENAME.to_string());

        info!("Heatmap: wrote {} file(s) to {}", files.len(), self.out_dir.display());
        Ok(files)
    }
}
