use crate::executor::{CommandExecutor, CommandExecutorConfig, ExecutionStatus};
use crate::span::{Span, parse_oracle_output};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("Failed to run structure oracle: {0}")]
    Invocation(String),
    #[error("Structure oracle timed out on {0:?}")]
    Timeout(PathBuf),
    #[error("Structure oracle failed on {path:?}: {reason}")]
    Failed { path: PathBuf, reason: String },
    #[error("Structure oracle reported success but did not write {0:?}")]
    MissingOutput(PathBuf),
    #[error("Path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),
}

/// The format-structure oracle: an external tool that understands one binary format.
///
/// It is the only component that knows where fields live inside a file. The learner treats it as
/// a black box with two operations.
pub trait StructureOracle: Send + Sync {
    /// Reports every labeled byte span the oracle recognises in `file`, in emission order.
    ///
    /// Malformed lines are skipped; an empty vector is a valid answer.
    fn parse(&self, file: &Path) -> Result<Vec<Span>, OracleError>;

    /// Writes a structure-aware mutation of `file`, targeting the inclusive byte range
    /// `start..=end`, to `out`.
    ///
    /// # Errors
    /// Any failure to produce `out`. The caller treats this as a failed attempt.
    fn abstract_span(
        &self,
        file: &Path,
        start: usize,
        end: usize,
        out: &Path,
    ) -> Result<(), OracleError>;
}

/// `StructureOracle` backed by a subprocess invoked as
/// `<command> parse <file>` and
/// `<command> abstract --targetfile <file> --targetstart <s> --targetend <e> <out>`.
pub struct CommandStructureOracle {
    executor: CommandExecutor,
}

impl CommandStructureOracle {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            executor: CommandExecutor::new(CommandExecutorConfig {
                command,
                timeout,
                working_dir: None,
                capture_stdout: true,
            }),
        }
    }

    fn run(&self, file: &Path, args: Vec<String>) -> Result<Vec<u8>, OracleError> {
        let output = self.executor.execute(&args, None);
        match output.status {
            ExecutionStatus::Ok => Ok(output.stdout),
            ExecutionStatus::Timeout => Err(OracleError::Timeout(file.to_path_buf())),
            ExecutionStatus::Failed(reason) => Err(OracleError::Failed {
                path: file.to_path_buf(),
                reason,
            }),
            ExecutionStatus::Other(reason) => Err(OracleError::Invocation(reason)),
        }
    }
}

fn path_arg(path: &Path) -> Result<String, OracleError> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| OracleError::NonUtf8Path(path.to_path_buf()))
}

impl StructureOracle for CommandStructureOracle {
    fn parse(&self, file: &Path) -> Result<Vec<Span>, OracleError> {
        let stdout = self.run(file, vec!["parse".to_string(), path_arg(file)?])?;
        Ok(parse_oracle_output(&String::from_utf8_lossy(&stdout)))
    }

    fn abstract_span(
        &self,
        file: &Path,
        start: usize,
        end: usize,
        out: &Path,
    ) -> Result<(), OracleError> {
        let args = vec![
            "abstract".to_string(),
            "--targetfile".to_string(),
            path_arg(file)?,
            "--targetstart".to_string(),
            start.to_string(),
            "--targetend".to_string(),
            end.to_string(),
            path_arg(out)?,
        ];
        self.run(file, args)?;
        if !out.exists() {
            return Err(OracleError::MissingOutput(out.to_path_buf()));
        }
        Ok(())
    }
}
