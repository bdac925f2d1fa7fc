use crate::checksum::ChecksumRegistry;
use crate::config::{FileFormat, RunContext};
use crate::value_store::ValueStore;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Reserved top-level key under which the checksum registry is embedded in the value tree.
pub const CHECKSUM_KEY: &str = "__checksum_algorithms__";
/// A flattened key with more distinct values than this is collapsed to [`TOO_MANY_VALUES`].
pub const FLATTEN_VALUE_LIMIT: usize = 10;
pub const TOO_MANY_VALUES: &str = "More than 10 values";
pub const FLATTENED_SUFFIX: &str = "_flattened";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Report I/O error: {0}")]
    Io(String),
    #[error("Report serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for ReportError {
    fn from(err: std::io::Error) -> Self {
        ReportError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlacklistReport {
    pub blacklisted_attributes: Vec<String>,
    pub total_count: usize,
    pub file_type: String,
    pub description: String,
}

impl BlacklistReport {
    pub fn new(values: &ValueStore, format: FileFormat, max_span_bytes: usize) -> Self {
        let names: Vec<String> = values.blacklists().all().into_iter().collect();
        Self {
            total_count: names.len(),
            blacklisted_attributes: names,
            file_type: format.to_string(),
            description: format!(
                "Attributes that were blacklisted due to size > {max_span_bytes} bytes or more than {} unique values",
                values.max_unique_values()
            ),
        }
    }
}

/// The value tree as JSON, with the checksum registry under [`CHECKSUM_KEY`].
pub fn value_tree_json(
    values: &ValueStore,
    checksums: &ChecksumRegistry,
) -> Result<Value, ReportError> {
    let mut tree = match serde_json::to_value(values.tree()) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => return Err(ReportError::Serialization(e.to_string())),
    };
    let registry =
        serde_json::to_value(checksums).map_err(|e| ReportError::Serialization(e.to_string()))?;
    tree.insert(CHECKSUM_KEY.to_string(), registry);
    Ok(Value::Object(tree))
}

/// Flattens nested JSON onto the innermost keys.
///
/// Every scalar is keyed by the last object key above it. Duplicate keys are merged keeping
/// distinct values in first-seen order; a single value stays a scalar, several become an array,
/// and more than [`FLATTEN_VALUE_LIMIT`] collapse to [`TOO_MANY_VALUES`].
pub fn flatten_json(data: &Value) -> Map<String, Value> {
    let mut collected: Vec<(String, Vec<Value>)> = Vec::new();
    collect_scalars(data, "", &mut collected);

    let mut out = Map::new();
    for (key, mut values) in collected {
        let flattened = match values.len() {
            0 => continue,
            1 => values.remove(0),
            n if n > FLATTEN_VALUE_LIMIT => Value::String(TOO_MANY_VALUES.to_string()),
            _ => Value::Array(values),
        };
        out.insert(key, flattened);
    }
    out
}

fn collect_scalars(value: &Value, key: &str, out: &mut Vec<(String, Vec<Value>)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                collect_scalars(v, k, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_scalars(item, key, out);
            }
        }
        scalar => match out.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => {
                if !values.contains(scalar) {
                    values.push(scalar.clone());
                }
            }
            None => out.push((key.to_string(), vec![scalar.clone()])),
        },
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReportError> {
    let file = File::create(path)
        .map_err(|e| ReportError::Io(format!("Failed to create {path:?}: {e}")))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| ReportError::Serialization(format!("Failed to write {path:?}: {e}")))?;
    writer.flush()?;
    Ok(())
}

fn flattened_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{FLATTENED_SUFFIX}.json"))
}

/// Writes the value tree, the blacklist report and a flattened companion of each into the run's
/// results directory. Returns every path written.
pub fn write_results(
    ctx: &RunContext,
    values: &ValueStore,
    checksums: &ChecksumRegistry,
    max_span_bytes: usize,
) -> Result<Vec<PathBuf>, ReportError> {
    let dir = ctx.results_dir();
    fs::create_dir_all(&dir)?;
    let values_path = dir.join(format!("{}_parsed_values_hex_original.json", ctx.format));
    let blacklist_path = dir.join(format!("{}_blacklisted_attributes.json", ctx.format));

    let tree = value_tree_json(values, checksums)?;
    let blacklist = serde_json::to_value(BlacklistReport::new(values, ctx.format, max_span_bytes))
        .map_err(|e| ReportError::Serialization(e.to_string()))?;

    let mut written = Vec::with_capacity(4);
    for (path, json) in [(values_path, tree), (blacklist_path, blacklist)] {
        write_json(&path, &json)?;
        tracing::info!("Results saved to {path:?}");
        let flat_path = flattened_path(&path);
        write_json(&flat_path, &flatten_json(&json))?;
        tracing::info!("Transformed {path:?} -> {flat_path:?}");
        written.push(path);
        written.push(flat_path);
    }
    Ok(written)
}

/// Appends per-file outcomes to `processed_success.log` and `processed_failed.log`.
pub struct FileResultLogger {
    success_file: PathBuf,
    failed_file: PathBuf,
    lock: Mutex<()>,
}

impl FileResultLogger {
    pub const SUCCESS_LOG: &'static str = "processed_success.log";
    pub const FAILED_LOG: &'static str = "processed_failed.log";

    /// Creates both logs with headers, or keeps appending to existing ones when `resume` is set.
    pub fn new(log_dir: &Path, resume: bool) -> Result<Self, ReportError> {
        let logger = Self {
            success_file: log_dir.join(Self::SUCCESS_LOG),
            failed_file: log_dir.join(Self::FAILED_LOG),
            lock: Mutex::new(()),
        };
        let rule = "=".repeat(80);
        for (path, title, format) in [
            (
                &logger.success_file,
                "# Successfully processed files",
                "# Format: timestamp | file_path | processing_time",
            ),
            (
                &logger.failed_file,
                "# Failed/Timed out files",
                "# Format: timestamp | file_path | reason | processing_time",
            ),
        ] {
            if resume && path.exists() {
                continue;
            }
            fs::write(path, format!("{title}\n{format}\n{rule}\n"))
                .map_err(|e| ReportError::Io(format!("Failed to create {path:?}: {e}")))?;
        }
        Ok(logger)
    }

    pub fn log_success(&self, file: &Path, elapsed: Duration) {
        self.append(
            &self.success_file,
            &format!("{} | {:.2}s", file.display(), elapsed.as_secs_f64()),
        );
    }

    pub fn log_failure(&self, file: &Path, reason: &str, elapsed: Duration) {
        self.append(
            &self.failed_file,
            &format!("{} | {reason} | {:.2}s", file.display(), elapsed.as_secs_f64()),
        );
    }

    pub fn log_timeout(&self, file: &Path, timeout: Duration) {
        let secs = timeout.as_secs_f64();
        self.append(
            &self.failed_file,
            &format!("{} | TIMEOUT after {secs:.0}s | {secs:.2}s+", file.display()),
        );
    }

    fn append(&self, path: &Path, line: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{timestamp} | {line}"));
        if let Err(e) = result {
            tracing::warn!("Failed to append to {path:?}: {e}");
        }
    }
}
