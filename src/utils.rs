use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const DAYS_PER_WEEK: usize = 7;
pub const SLOT_MINUTES: u32 = 5;
pub const SLOTS_PER_DAY: usize = (24 * 60 / SLOT_MINUTES) as usize;

/// Rendering used for `generated_at`, `last_updated` and log lines.
pub const LOCAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Minute-resolution rendering used by CSV export/import.
pub const CSV_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Day of week with Sunday = 0, evaluated in the timestamp's own zone.
pub fn day_of_week<T: Datelike>(local: &T) -> u32 {
    local.weekday().num_days_from_sunday()
}

/// Index of the 5-minute window containing `local`, counted from local midnight.
pub fn time_slot<T: Timelike>(local: &T) -> u32 {
    (local.hour() * 60 + local.minute()) / SLOT_MINUTES
}

/// Drops seconds and sub-second precision.
pub fn truncate_to_minute<Tz: TimeZone>(ts: &DateTime<Tz>) -> DateTime<Tz> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| ts.clone())
}

/// First instant of `date` in `tz`. A midnight skipped by a DST jump resolves
/// to the same wall-clock time read as UTC.
pub fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// Round half away from zero to one decimal place.
pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Write `path` via a sibling temp file and rename, so readers never observe a
/// half-written artifact.
pub fn write_atomically<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    write(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::America::Chicago;

    #[test]
    fn slot_covers_the_whole_day() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        for minute in 0..(24 * 60) {
            let t = day.and_hms_opt(minute / 60, minute % 60, 59).unwrap();
            let slot = time_slot(&t);
            assert_eq!(slot, minute / 5);
            assert!((slot as usize) < SLOTS_PER_DAY);
        }
        assert_eq!(SLOTS_PER_DAY, 288);
    }

    #[test]
    fn day_of_week_uses_local_zone_and_sunday_zero() {
        // 2025-03-03 03:30 UTC is Sunday 21:30 in Chicago.
        let utc = Utc.with_ymd_and_hms(2025, 3, 3, 3, 30, 0).unwrap();
        assert_eq!(day_of_week(&utc), 1);
        assert_eq!(day_of_week(&utc.with_timezone(&Chicago)), 0);
        assert_eq!(time_slot(&utc.with_timezone(&Chicago)), (21 * 60 + 30) / 5);
    }

    #[test]
    fn truncates_seconds_and_nanos() {
        let ts = Chicago.with_ymd_and_hms(2025, 6, 1, 10, 7, 42).unwrap()
            + chrono::Duration::milliseconds(250);
        let truncated = truncate_to_minute(&ts);
        assert_eq!(truncated, Chicago.with_ymd_and_hms(2025, 6, 1, 10, 7, 0).unwrap());
    }

    #[test]
    fn local_midnight_handles_regular_days() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 4).unwrap();
        let midnight = local_midnight(&Chicago, date);
        assert_eq!(midnight.with_timezone(&Utc), Utc.with_ymd_and_hms(2025, 7, 4, 5, 0, 0).unwrap());
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_one_decimal(66.66666), 66.7);
        assert_eq!(round_one_decimal(12.25), 12.3);
        assert_eq!(round_one_decimal(50.0), 50.0);
    }

    #[test]
    fn atomic_write_replaces_file_contents() {
        let dir = std::env::temp_dir().join(format!("parking-utils-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("artifact.json");
        write_atomically(&path, |w| w.write_all(b"first")).unwrap();
        write_atomically(&path, |w| w.write_all(b"second")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.join(".artifact.json.tmp").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
