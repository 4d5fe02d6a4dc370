//! Weekly CSV export of raw readings and bulk import of such files.
//!
//! Rows are `timestamp,lot_name,occupied_spots,available_spots` with the
//! timestamp in local time at minute resolution.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::db::models::NewReading;
use crate::db::store::{ReadingStore, StoreError};
use crate::models::lot::{Lot, LotId, Occupancy};
use crate::utils::{local_midnight, write_atomically, CSV_TIMESTAMP_FORMAT};

pub const CSV_HEADER: [&str; 4] = ["timestamp", "lot_name", "occupied_spots", "available_spots"];
pub const IMPORT_BATCH_SIZE: usize = 100;

#[derive(Debug)]
pub enum ExportError {
    Io { path: PathBuf, source: io::Error },
    Store(StoreError),
    Parse { path: PathBuf, line: usize, message: String },
}

impl core::fmt::Display for ExportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExportError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ExportError::Store(e) => write!(f, "{}", e),
            ExportError::Parse { path, line, message } => write!(f, "{}:{}: {}", path.display(), line, message),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<StoreError> for ExportError {
    fn from(value: StoreError) -> Self {
        ExportError::Store(value)
    }
}

/// `week_{iso_year}_{iso_week:02}.csv` for the ISO week containing `day`.
pub fn week_filename(day: NaiveDate) -> String {
    let week = day.iso_week();
    format!("week_{}_{:02}.csv", week.year(), week.week())
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
}

/// Export every reading of the ISO week (Monday to Sunday, local time)
/// containing `day`. Returns the written file.
pub fn export_week<S: ReadingStore + ?Sized>(
    store: &mut S,
    lots: &[Lot],
    tz: Tz,
    day: NaiveDate,
    out_dir: &Path,
) -> Result<PathBuf, ExportError> {
    let monday = week_start(day);
    debug_assert_eq!(monday.weekday(), Weekday::Mon);
    let from = local_midnight(&tz, monday).with_timezone(&Utc);
    let to = local_midnight(&tz, monday + Duration::days(7)).with_timezone(&Utc);
    let readings = store.readings_between(from, to)?;

    let names: HashMap<LotId, &str> = lots.iter().map(|l| (l.id, l.name.as_str())).collect();

    fs::create_dir_all(out_dir).map_err(|source| ExportError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let path = out_dir.join(week_filename(day));

    let mut written = 0usize;
    write_atomically(&path, |w| {
        writeln!(w, "{}", CSV_HEADER.join(","))?;
        for r in &readings {
            let Some(name) = names.get(&r.lot()) else {
                continue;
            };
            writeln!(
                w,
                "{},{},{},{}",
                r.time.with_timezone(&tz).format(CSV_TIMESTAMP_FORMAT),
                name,
                r.occupied_spots,
                r.available_spots
            )?;
            written += 1;
        }
        Ok(())
    })
    .map_err(|source| ExportError::Io {
        path: path.clone(),
        source,
    })?;

    info!("Export: wrote {} reading(s) to {}", written, path.display());
    Ok(path)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub files_imported: usize,
    pub files_failed: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
}

struct Columns {
    timestamp: usize,
    lot_name: usize,
    occupied: usize,
    available: usize,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self, String> {
        let cells: Vec<&str> = header.split(',').map(str::trim).collect();
        let find = |name: &str| {
            cells
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| format!("missing column '{}'", name))
        };
        Ok(Columns {
            timestamp: find(CSV_HEADER[0])?,
            lot_name: find(CSV_HEADER[1])?,
            occupied: find(CSV_HEADER[2])?,
            available: find(CSV_HEADER[3])?,
        })
    }
}

enum Row {
    Reading(NewReading),
    Skipped,
}

fn parse_row(line: &str, cols: &Columns, lots: &HashMap<&str, LotId>, tz: Tz) -> Result<Row, String> {
    let cells: Vec<&str> = line.split(',').map(str::trim).collect();
    let cell = |i: usize| cells.get(i).copied().ok_or_else(|| format!("expected at least {} fields", i + 1));

    let naive = NaiveDateTime::parse_from_str(cell(cols.timestamp)?, CSV_TIMESTAMP_FORMAT)
        .map_err(|e| format!("bad timestamp: {}", e))?;
    let lot_name = cell(cols.lot_name)?;
    let Some(lot) = lots.get(lot_name) else {
        warn!("Import: unknown lot name {}, skipping", lot_name);
        return Ok(Row::Skipped);
    };
    let occupied: i32 = cell(cols.occupied)?
        .parse()
        .map_err(|e| format!("bad occupied_spots: {}", e))?;
    let available: i32 = cell(cols.available)?
        .parse()
        .map_err(|e| format!("bad available_spots: {}", e))?;
    if occupied < 0 || available < 0 {
        return Err("spot counts must be non-negative".to_string());
    }

    let Some(local) = tz.from_local_datetime(&naive).earliest() else {
        warn!("Import: {} does not exist in {}, skipping", naive, tz.name());
        return Ok(Row::Skipped);
    };

    Ok(Row::Reading(NewReading::new(
        local.with_timezone(&Utc),
        *lot,
        Occupancy { occupied, available },
    )))
}

/// Import one CSV file in batches. A malformed row aborts the file, though
/// batches already inserted stay.
pub fn import_file<S: ReadingStore + ?Sized>(
    store: &mut S,
    lots: &[Lot],
    tz: Tz,
    path: &Path,
) -> Result<ImportSummary, ExportError> {
    let text = fs::read_to_string(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |line: usize, message: String| ExportError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let by_name: HashMap<&str, LotId> = lots.iter().map(|l| (l.name.as_str(), l.id)).collect();
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Ok(ImportSummary::default());
    };
    let cols = Columns::from_header(header).map_err(|m| parse_err(1, m))?;

    let mut summary = ImportSummary::default();
    let mut batch = Vec::with_capacity(IMPORT_BATCH_SIZE);
    for (index, line) in lines {
        match parse_row(line, &cols, &by_name, tz).map_err(|m| parse_err(index + 1, m))? {
            Row::Reading(r) => batch.push(r),
            Row::Skipped => summary.rows_skipped += 1,
        }
        if batch.len() >= IMPORT_BATCH_SIZE {
            summary.rows_inserted += store.append_batch(&batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        summary.rows_inserted += store.append_batch(&batch)?;
    }

    summary.files_imported = 1;
    info!(
        "Import: {} row(s) from {} ({} skipped)",
        summary.rows_inserted,
        path.display(),
        summary.rows_skipped
    );
    Ok(summary)
}

/// Import every `*.csv` in `dir`, in file-name order. A file that fails is
/// logged and counted; the remaining files are still imported.
pub fn import_dir<S: ReadingStore + ?Sized>(
    store: &mut S,
    lots: &[Lot],
    tz: Tz,
    dir: &Path,
) -> Result<ImportSummary, ExportError> {
    let entries = fs::read_dir(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();

    if files.is_empty() {
        warn!("Import: no CSV files found in {}", dir.display());
    }

    let mut total = ImportSummary::default();
    for file in &files {
        match import_file(store, lots, tz, file) {
            Ok(s) => {
                total.files_imported += s.files_imported;
                total.rows_inserted += s.rows_inserted;
                total.rows_skipped += s.rows_skipped;
            }
            Err(ExportError::Store(e)) if e.is_connection_loss() => return Err(ExportError::Store(e)),
            Err(e) => {
                warn!("Import: {} failed: {}", file.display(), e);
                total.files_failed += 1;
            }
        }
    }
    info!(
        "Import: {}/{} file(s) imported, {} row(s) inserted",
        total.files_imported,
        files.len(),
        total.rows_inserted
    );
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::lot::default_catalog;
    use chrono_tz::America::Chicago;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("parking-export-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn week_filename_uses_iso_week() {
        assert_eq!(week_filename(NaiveDate::from_ymd_opt(2025, 3, 8).unwrap()), "week_2025_10.csv");
        // 2024-12-30 belongs to ISO week 1 of 2025.
        assert_eq!(week_filename(NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()), "week_2025_01.csv");
        assert_eq!(week_start(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()), NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
    }

    #[test]
    fn export_covers_monday_to_sunday_in_local_time() {
        let dir = temp_dir("week");
        let lots = default_catalog();
        let mut store = MemoryStore::default();
        let at = |d, h, m| Chicago.with_ymd_and_hms(2025, 6, d, h, m, 0).unwrap().with_timezone(&Utc);
        // Sunday before, Monday 00:00, Sunday 23:55, next Monday.
        for (t, lot) in [(at(1, 23, 55), 1), (at(2, 0, 0), 1), (at(8, 23, 55), 3), (at(9, 0, 0), 2)] {
            store.insert(NewReading::new(t, LotId(lot), Occupancy { occupied: 1, available: 2 }));
        }
        store.insert(NewReading::new(at(4, 12, 0), LotId(99), Occupancy { occupied: 1, available: 2 }));

        let day = NaiveDate::from_ymd_opt(2025, 6, 8).unwrap();
        let path = export_week(&mut store, &lots, Chicago, day, &dir).unwrap();

        assert_eq!(path.file_name().unwrap(), "week_2025_23.csv");
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "timestamp,lot_name,occupied_spots,available_spots",
                "2025-06-02 00:00,Stadium_Deck,1,2",
                "2025-06-08 23:55,Haley_Deck,1,2",
            ]
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn exported_file_imports_back() {
        let dir = temp_dir("roundtrip");
        let lots = default_catalog();
        let mut source = MemoryStore::default();
        let base = Chicago.with_ymd_and_hms(2025, 6, 3, 8, 0, 0).unwrap();
        for i in 0..250 {
            let t = (base + Duration::minutes(5 * i)).with_timezone(&Utc);
            source.insert(NewReading::new(t, LotId(1 + (i % 3) as i32), Occupancy { occupied: 1, available: 1 }));
        }
        export_week(&mut source, &lots, Chicago, base.date_naive(), &dir).unwrap();

        let mut target = MemoryStore::default();
        let summary = import_dir(&mut target, &lots, Chicago, &dir).unwrap();

        assert_eq!(summary.files_imported, 1);
        assert_eq!(summary.rows_inserted, 250);
        let times = |s: &MemoryStore| s.readings().iter().map(|r| (r.time, r.lot_id)).collect::<Vec<_>>();
        assert_eq!(times(&target), times(&source));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unknown_lots_are_skipped_and_bad_files_counted() {
        let dir = temp_dir("import");
        fs::write(
            dir.join("a.csv"),
            "timestamp,lot_name,occupied_spots,available_spots\n\
             2025-06-03 08:00,Stadium_Deck,3,1\n\
             2025-06-03 08:00,Nowhere_Deck,3,1\n",
        )
        .unwrap();
        fs::write(
            dir.join("b.csv"),
            "timestamp,lot_name,occupied_spots,available_spots\n2025-06-03 08:05,Haley_Deck,x,1\n",
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let lots = default_catalog();
        let mut store = MemoryStore::default();
        let summary = import_dir(&mut store, &lots, Chicago, &dir).unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                files_imported: 1,
                files_failed: 1,
                rows_inserted: 1,
                rows_skipped: 1,
            }
        );
        let r = &store.readings()[0];
        assert_eq!(r.time, Chicago.with_ymd_and_hms(2025, 6, 3, 8, 0, 0).unwrap().with_timezone(&Utc));
        assert_eq!((r.occupied_spots, r.available_spots), (3, 1));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_row_reports_line_number() {
        let dir = temp_dir("line");
        let path = dir.join("bad.csv");
        fs::write(&path, "timestamp,lot_name,occupied_spots,available_spots\n2025-06-03,Haley_Deck,1,1\n").unwrap();
        let mut store = MemoryStore::default();
        let err = import_file(&mut store, &default_catalog(), Chicago, &path).unwrap_err();
        assert!(matches!(err, ExportError::Parse { line: 2, .. }));
        fs::remove_dir_all(&dir).unwrap();
    }
}
