//! Common utility functions for the command line front end.
//!
//! This module contains shared utilities including:
//! - Logger initialization
//! - Path validation and file discovery
//! - Result output

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use roadtrack::InferenceInstance;
use roadtrack::sim::ResultRow;

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("cannot open log file '{}'", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Validate that an input file exists.
pub fn validate_input_path(input: &Path) -> Result<()> {
    if !input.exists() {
        bail!("Input path '{}' does not exist.", input.display());
    }
    if !input.is_file() {
        bail!("Input path '{}' is not a file.", input.display());
    }
    Ok(())
}

/// Get all CSV files from a path (either single file or all CSVs in directory).
///
/// # Returns
/// A sorted vector of PathBuf for each CSV file found.
pub fn get_csv_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        if input.extension().and_then(|s| s.to_str()) != Some("csv") {
            bail!("Input file '{}' is not a CSV file.", input.display());
        }
        Ok(vec![input.to_path_buf()])
    } else if input.is_dir() {
        let mut csv_files: Vec<PathBuf> = std::fs::read_dir(input)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("csv")
            })
            .collect();

        if csv_files.is_empty() {
            bail!("No CSV files found in directory '{}'.", input.display());
        }

        // Sort for consistent ordering
        csv_files.sort();
        Ok(csv_files)
    } else {
        bail!(
            "Input path '{}' is neither a file nor a directory.",
            input.display()
        )
    }
}

/// Create the output directory if it does not exist yet.
pub fn validate_output_path(output: &Path) -> Result<()> {
    if !output.exists() {
        std::fs::create_dir_all(output)
            .with_context(|| format!("cannot create output directory '{}'", output.display()))?;
    }
    Ok(())
}

/// Write an instance's result history to `<output>/<vehicle_id>.csv`.
pub fn write_results(output: &Path, instance: &InferenceInstance) -> Result<PathBuf> {
    let rows: Vec<ResultRow> = instance
        .result_records()
        .iter()
        .map(|record| ResultRow::from_record(instance.vehicle_id(), record))
        .collect();
    let file = output.join(format!("{}.csv", instance.vehicle_id()));
    ResultRow::to_csv(&rows, &file)
        .with_context(|| format!("cannot write results to '{}'", file.display()))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_is_rejected() {
        let missing = std::env::temp_dir().join("roadtrack-sim-does-not-exist.csv");
        assert!(validate_input_path(&missing).is_err());
        assert!(get_csv_files(&missing).is_err());
    }

    #[test]
    fn csv_files_are_discovered_in_order() {
        let dir = std::env::temp_dir().join(format!("roadtrack-sim-csv-{}", std::process::id()));
        validate_output_path(&dir).unwrap();
        for name in ["b.csv", "a.csv", "notes.txt"] {
            std::fs::write(dir.join(name), "").unwrap();
        }
        let files = get_csv_files(&dir).unwrap();
        assert_eq!(files, vec![dir.join("a.csv"), dir.join("b.csv")]);
        assert!(get_csv_files(&dir.join("notes.txt")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
