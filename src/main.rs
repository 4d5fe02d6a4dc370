pub mod models {
    pub mod fopark;
    pub mod lot;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod models;
    pub mod store;
    #[cfg(test)]
    pub mod memory;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod aggregate;
    pub mod clock;
    pub mod crawl;
    pub mod export;
    pub mod fake_data;
    pub mod heatmap;
    pub mod publish;
    pub mod scheduler;
}

use crate::client::FoparkClient;
use crate::config::Config;
use crate::db::store::{PgStore, ReadingStore};
use crate::services::crawl::TrackedLot;
use crate::services::heatmap::HeatmapWriter;
use crate::services::publish::{GitArchive, ObjectStorePublisher, ReleasePublisher};
use crate::services::scheduler::{Scheduler, SchedulerConfig};
use crate::services::{export, fake_data};
use chrono::Utc;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

/// What the process does after bootstrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Serve,
    AggregateOnly,
    ImportCsv(PathBuf),
    FakeData(u32),
}

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    mode: Mode,
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

fn run(mode: Mode) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (tz={}, crawl_interval={}m, grace={}m, fetch_timeout={}s, lots={}, windows={}, object_store={}, git_snapshot={})",
        cfg.local_tz.name(),
        cfg.crawl_interval_minutes,
        cfg.daily_grace_minutes,
        cfg.fetch_timeout.as_secs(),
        cfg.lots.len(),
        cfg.heatmap_windows
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(","),
        cfg.object_store.is_some(),
        cfg.git_repo_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );

    // 2) Connect DB
    let mut store = PgStore::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    match store.server_version() {
        Ok(version) => info!("Connected to database ({})", version),
        Err(e) => warn!("Connected to database; version query failed: {}", e),
    }

    // 3) Apply pending database migrations
    store.apply_migrations()?;

    // 4) Dispatch
    match mode {
        Mode::Serve => serve(store, cfg),
        Mode::AggregateOnly => aggregate_once(&mut store, &cfg),
        Mode::ImportCsv(dir) => {
            let summary = export::import_dir(&mut store, &cfg.lots, cfg.local_tz, &dir)
                .map_err(|e| format!("CSV import failed: {}", e))?;
            info!(
                "CSV import finished: files={}, failed={}, inserted={}, skipped={}",
                summary.files_imported, summary.files_failed, summary.rows_inserted, summary.rows_skipped
            );
            Ok(())
        }
        Mode::FakeData(days) => {
            fake_data::run(&mut store, &cfg.lots, cfg.local_tz, days, Utc::now())
                .map_err(|e| format!("fake data seeding failed: {}", e))?;
            Ok(())
        }
    }
}

fn aggregate_once(store: &mut PgStore, cfg: &Config) -> Result<(), String> {
    let rows = store.row_count().map_err(|e| format!("row count failed: {}", e))?;
    if rows == 0 {
        warn!("No readings stored yet; skipping heatmap generation");
        return Ok(());
    }
    let now = Utc::now().with_timezone(&cfg.local_tz);
    let written = HeatmapWriter::new(&cfg.lots, &cfg.heatmap_windows, &cfg.heatmap_dir)
        .generate_all(store, &now)
        .map_err(|e| format!("heatmap generation failed: {}", e))?;
    info!(
        "Wrote {} artifact(s) to {}",
        written.len(),
        cfg.heatmap_dir.display()
    );
    Ok(())
}

fn serve(store: PgStore, cfg: Config) -> Result<(), String> {
    let client = FoparkClient::new(cfg.fetch_timeout);
    let lots = cfg
        .lots
        .iter()
        .map(|lot| TrackedLot {
            lot: lot.clone(),
            source: Box::new(client.source_for(lot)),
        })
        .collect::<Vec<_>>();

    let publisher = ReleasePublisher {
        object_store: cfg
            .object_store
            .clone()
            .map(|os| ObjectStorePublisher::new(os, cfg.fetch_timeout))
            .transpose()?,
        git: cfg.git_repo_dir.clone().map(|repo_dir| GitArchive { repo_dir }),
    };

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| format!("failed to install signal handler: {}", e))?;

    let scheduler_cfg = SchedulerConfig {
        crawl_interval_minutes: cfg.crawl_interval_minutes.get(),
        grace_minutes: cfg.daily_grace_minutes.get(),
        windows: cfg.heatmap_windows,
        heatmap_dir: cfg.heatmap_dir,
        export_dir: cfg.export_dir,
        reconnect_attempts: cfg.store_reconnect_attempts,
        reconnect_backoff: RECONNECT_BACKOFF,
    };
    Scheduler::new(store, publisher, lots, cfg.local_tz, scheduler_cfg)
        .run(&stop_rx)
        .map_err(|e| e.to_string())?;
    info!("Scheduler stopped");
    Ok(())
}

fn parse_cli<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut mode: Option<Mode> = None;

    let mut set_mode = |m: Mode| {
        if mode.is_some() {
            return Err("only one of --aggregate-only, --import-csv, --fake-data may be given".to_string());
        }
        mode = Some(m);
        Ok(())
    };

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some("--aggregate-only") => set_mode(Mode::AggregateOnly)?,
            Some("--import-csv") => {
                let dir = args
                    .next()
                    .ok_or_else(|| "`--import-csv` requires a directory argument".to_string())?;
                set_mode(Mode::ImportCsv(PathBuf::from(dir)))?;
            }
            Some("--fake-data") => {
                let days = args
                    .next()
                    .ok_or_else(|| "`--fake-data` requires a number of days".to_string())?;
                let days = days
                    .to_str()
                    .and_then(|d| d.parse::<u32>().ok())
                    .filter(|d| *d > 0)
                    .ok_or_else(|| format!("`--fake-data` expects a positive integer, got {:?}", days))?;
                set_mode(Mode::FakeData(days))?;
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    Ok(CliArgs {
        env_file,
        mode: mode.unwrap_or(Mode::Serve),
    })
}

fn configure_env(env_file: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Ok(Some(LoadedEnvFile { path, explicit: true }))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Ok(Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            }))
        } else {
            Ok(None)
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // Preserve any value that was already supplied via the process environment.
                if std::env::var_os(&key).is_none() {
                    // Updating process-level environment variables is unsafe on some targets.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(format!("{}:{}: {}", path.display(), index + 1, e));
            }
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let without_export = trimmed
        .strip_prefix("export ")
        .map(|s| s.trim_start())
        .unwrap_or(trimmed);

    let mut parts = without_export.splitn(2, '=');
    let key = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| "missing environment variable name".to_string())?;
    let value_part = parts.next().ok_or_else(|| "missing '=' in assignment".to_string())?;

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = parse_env_value(value_part)?;
    Ok(Some((key.to_string(), value)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    if let Some(rest) = trimmed.strip_prefix('"') {
        parse_double_quoted(rest)
    } else if let Some(rest) = trimmed.strip_prefix('\'') {
        parse_single_quoted(rest)
    } else {
        let value = trimmed.splitn(2, '#').next().unwrap_or_default().trim_end();
        Ok(value.to_string())
    }
}

fn parse_double_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    let mut escape = false;

    while let Some(ch) = chars.next() {
        if escape {
            let value = match ch {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                '\\' => '\\',
                '"' => '"',
                other => other,
            };
            result.push(value);
            escape = false;
            continue;
        }

        match ch {
            '\\' => escape = true,
            '"' => {
                let remainder = chars.as_str().trim();
                if remainder.is_empty() || remainder.starts_with('#') {
                    return Ok(result);
                } else {
                    return Err("unexpected characters after closing double quote".to_string());
                }
            }
            other => result.push(other),
        }
    }

    if escape {
        Err("unterminated escape sequence in double-quoted value".to_string())
    } else {
        Err("unterminated double-quoted value".to_string())
    }
}

fn parse_single_quoted(input: &str) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch == '\'' {
            let remainder = chars.as_str().trim();
            if remainder.is_empty() || remainder.starts_with('#') {
                return Ok(result);
            } else {
                return Err("unexpected characters after closing single quote".to_string());
            }
        } else {
            result.push(ch);
        }
    }

    Err("unterminated single-quoted value".to_string())
}

fn main() {
    let (mode, loaded_env) = match parse_cli(std::env::args_os().skip(1))
        .and_then(|cli| configure_env(cli.env_file).map(|loaded| (cli.mode, loaded)))
    {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "parking-heatmaps {} (git {}) starting in {:?} mode",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH"),
        mode
    );
    if let Err(e) = run(mode) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn cli(args: &[&str]) -> Result<CliArgs, String> {
        parse_cli(args.iter().map(OsString::from))
    }

    #[test]
    fn no_arguments_serve() {
        assert_eq!(
            cli(&[]).unwrap(),
            CliArgs {
                env_file: None,
                mode: Mode::Serve
            }
        );
    }

    #[test]
    fn modes_and_env_file_combine() {
        let args = cli(&["--env-file=prod.env", "--import-csv", "data"]).unwrap();
        assert_eq!(args.env_file, Some(PathBuf::from("prod.env")));
        assert_eq!(args.mode, Mode::ImportCsv(PathBuf::from("data")));

        assert_eq!(cli(&["--fake-data", "30"]).unwrap().mode, Mode::FakeData(30));
        assert_eq!(cli(&["--aggregate-only"]).unwrap().mode, Mode::AggregateOnly);
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(cli(&["--fake-data", "0"]).is_err());
        assert!(cli(&["--fake-data"]).is_err());
        assert!(cli(&["--import-csv"]).is_err());
        assert!(cli(&["--aggregate-only", "--fake-data", "2"]).is_err());
        assert!(cli(&["--env-file", "a", "--env-file", "b"]).is_err());
        assert!(cli(&["--verbose"]).is_err());
    }

    #[test]
    fn env_assignments_parse_quotes_and_comments() {
        assert_eq!(parse_env_assignment("# comment").unwrap(), None);
        assert_eq!(parse_env_assignment("   ").unwrap(), None);
        assert_eq!(
            parse_env_assignment("export LOCAL_TIMEZONE=America/Chicago # campus").unwrap(),
            Some(("LOCAL_TIMEZONE".to_string(), "America/Chicago".to_string()))
        );
        assert_eq!(
            parse_env_assignment(r#"R2_PREFIX="heat maps/\n""#).unwrap(),
            Some(("R2_PREFIX".to_string(), "heat maps/\n".to_string()))
        );
        assert_eq!(
            parse_env_assignment("R2_SECRET_ACCESS_KEY='a#b'").unwrap(),
            Some(("R2_SECRET_ACCESS_KEY".to_string(), "a#b".to_string()))
        );
        assert!(parse_env_assignment("NO_EQUALS").is_err());
        assert!(parse_env_assignment("BAD KEY=1").is_err());
        assert!(parse_env_assignment("X=\"unterminated").is_err());
    }
}
