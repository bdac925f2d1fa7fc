use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Binary formats the learner knows how to validate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Avi,
    Bmp,
    Gif,
    Jpg,
    Png,
    Midi,
    Pcap,
    Wav,
    Mp3,
    Mp4,
    Zip,
}

impl FileFormat {
    pub const ALL: [FileFormat; 11] = [
        FileFormat::Avi,
        FileFormat::Bmp,
        FileFormat::Gif,
        FileFormat::Jpg,
        FileFormat::Png,
        FileFormat::Midi,
        FileFormat::Pcap,
        FileFormat::Wav,
        FileFormat::Mp3,
        FileFormat::Mp4,
        FileFormat::Zip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Avi => "avi",
            FileFormat::Bmp => "bmp",
            FileFormat::Gif => "gif",
            FileFormat::Jpg => "jpg",
            FileFormat::Png => "png",
            FileFormat::Midi => "midi",
            FileFormat::Pcap => "pcap",
            FileFormat::Wav => "wav",
            FileFormat::Mp3 => "mp3",
            FileFormat::Mp4 => "mp4",
            FileFormat::Zip => "zip",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        FileFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == lowered)
            .ok_or_else(|| {
                let supported: Vec<&str> = FileFormat::ALL.iter().map(|f| f.as_str()).collect();
                anyhow::anyhow!(
                    "Unsupported file type '{s}'. Supported types: {}",
                    supported.join(", ")
                )
            })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    #[serde(default = "default_max_span_bytes")]
    pub max_span_bytes: usize,
    #[serde(default = "default_max_unique_values")]
    pub max_unique_values: usize,
    #[serde(default = "default_attempts")]
    pub max_abstraction_attempts: u32,
    #[serde(default = "default_attempts")]
    pub max_overwrite_attempts: u32,
}

fn default_max_span_bytes() -> usize {
    8
}

fn default_max_unique_values() -> usize {
    30
}

fn default_attempts() -> u32 {
    10
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_span_bytes: default_max_span_bytes(),
            max_unique_values: default_max_unique_values(),
            max_abstraction_attempts: default_attempts(),
            max_overwrite_attempts: default_attempts(),
        }
    }
}

/// How the structure oracle is invoked. `{format}` in `command` is replaced by the format name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_oracle_command")]
    pub command: Vec<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_subprocess_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_oracle_command() -> Vec<String> {
    vec!["./{format}-fuzzer".to_string()]
}

fn default_delimiter() -> char {
    crate::span::DEFAULT_PATH_DELIMITER
}

fn default_subprocess_timeout_ms() -> u64 {
    30_000
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            command: default_oracle_command(),
            delimiter: default_delimiter(),
            timeout_ms: default_subprocess_timeout_ms(),
        }
    }
}

/// Validity checking. Without `command` the per-format external checker is used;
/// with it, `{}` is replaced by the file path and exit status 0 means valid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ValidatorSettings {
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_subprocess_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            command: None,
            timeout_ms: default_subprocess_timeout_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ParallelSettings {
    /// `None` means one worker per available core; `1` runs sequentially.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_file_timeout_secs() -> u64 {
    600
}

impl ParallelSettings {
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            workers: None,
            batch_size: default_batch_size(),
            file_timeout_secs: default_file_timeout_secs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CheckpointSettings {
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
}

fn default_save_interval() -> usize {
    10
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            save_interval: default_save_interval(),
        }
    }
}

/// Canonical field names routed to checksum fingerprinting and compression handling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChecksumSettings {
    #[serde(default = "default_checksum_fields")]
    pub checksum_fields: Vec<String>,
    #[serde(default = "default_type_fields")]
    pub type_fields: Vec<String>,
    #[serde(default = "default_compression_fields")]
    pub compression_fields: Vec<String>,
    #[serde(default = "default_payload_fields")]
    pub payload_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub decompress: bool,
    #[serde(default = "default_mandated_algorithm")]
    pub mandated_algorithm: String,
    /// Decompressed payloads larger than this are inconclusive.
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: u64,
}

fn default_checksum_fields() -> Vec<String> {
    ["crc", "frCrc", "deCrc", "HdrChecksum", "checksum"]
        .map(String::from)
        .to_vec()
}

fn default_type_fields() -> Vec<String> {
    ["cname", "chunkID", "ckID"].map(String::from).to_vec()
}

fn default_compression_fields() -> Vec<String> {
    ["frCompression"].map(String::from).to_vec()
}

fn default_payload_fields() -> Vec<String> {
    ["frData"].map(String::from).to_vec()
}

fn default_true() -> bool {
    true
}

fn default_mandated_algorithm() -> String {
    "CRC-32".to_string()
}

fn default_max_decompressed_bytes() -> u64 {
    64 * 1024 * 1024
}

impl ChecksumSettings {
    pub fn is_checksum_field(&self, name: &str) -> bool {
        self.checksum_fields.iter().any(|f| f == name)
    }

    pub fn is_type_field(&self, name: &str) -> bool {
        self.type_fields.iter().any(|f| f == name)
    }

    pub fn is_compression_field(&self, name: &str) -> bool {
        self.compression_fields.iter().any(|f| f == name)
    }

    pub fn is_payload_field(&self, name: &str) -> bool {
        self.payload_fields.iter().any(|f| f == name)
    }
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            checksum_fields: default_checksum_fields(),
            type_fields: default_type_fields(),
            compression_fields: default_compression_fields(),
            payload_fields: default_payload_fields(),
            decompress: true,
            mandated_algorithm: default_mandated_algorithm(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PathSettings {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_logs_root")]
    pub logs_root: PathBuf,
}

pub fn default_data_root() -> PathBuf {
    PathBuf::from("./testcases_4_learn")
}

pub fn default_logs_root() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            logs_root: default_logs_root(),
        }
    }
}

/// Immutable settings shared by every component of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LearnerConfig {
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub validator: ValidatorSettings,
    #[serde(default)]
    pub parallel: ParallelSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default)]
    pub checksum: ChecksumSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

impl LearnerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: LearnerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Oracle argv with `{format}` substituted.
    pub fn oracle_command(&self, format: FileFormat) -> Vec<String> {
        self.oracle
            .command
            .iter()
            .map(|arg| arg.replace("{format}", format.as_str()))
            .collect()
    }
}

/// What the user asked for: the typed form of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub format: FileFormat,
    pub max_files: Option<usize>,
    pub source_dir: Option<PathBuf>,
    pub resume: bool,
}

impl RunConfig {
    pub fn new(format: FileFormat) -> Self {
        Self {
            format,
            max_files: None,
            source_dir: None,
            resume: false,
        }
    }
}

/// Paths of one run. Every run owns a directory `<logs-root>/<run_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub format: FileFormat,
    pub run_dir: PathBuf,
    pub seed_dir: PathBuf,
}

impl RunContext {
    pub const CHECKPOINT_FILENAME: &'static str = "checkpoint.json";

    /// Context for a fresh run started at `now`.
    pub fn fresh(config: &LearnerConfig, run: &RunConfig, now: DateTime<Local>) -> Self {
        let run_id = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), run.format);
        Self::at(config, run, run_id)
    }

    /// Context for an existing run directory named `run_id`.
    pub fn at(config: &LearnerConfig, run: &RunConfig, run_id: String) -> Self {
        let run_dir = config.paths.logs_root.join(&run_id);
        let seed_dir = run.source_dir.clone().unwrap_or_else(|| {
            config
                .paths
                .data_root
                .join(run.format.as_str())
                .join("passed")
        });
        Self {
            run_id,
            format: run.format,
            run_dir,
            seed_dir,
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.run_dir.join("results")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.run_dir.join("abstracted")
    }

    pub fn special_dir(&self) -> PathBuf {
        self.run_dir.join("abstracted_special")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.run_dir.join(Self::CHECKPOINT_FILENAME)
    }

    pub fn ensure_directories_exist(&self) -> std::io::Result<()> {
        for dir in [self.results_dir(), self.scratch_dir(), self.special_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
