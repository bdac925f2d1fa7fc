use crate::config::{FileFormat, ValidatorSettings};
use crate::executor::{CommandExecutor, CommandExecutorConfig, ExecutionStatus};
use std::path::Path;
use std::time::Duration;

/// Placeholder replaced by the file path in validator argument templates.
pub const FILE_PLACEHOLDER: &str = "{}";

/// Decides whether a file is still a well-formed instance of its format.
pub trait ValidityOracle: Send + Sync {
    fn is_valid(&self, file: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    ExitSuccess,
    StdoutContains(&'static str),
    /// Every stdout line must not start with the given prefix.
    NoLineStartsWith(&'static str),
}

/// Runs a format-specific external checker.
pub struct FormatValidator {
    executor: CommandExecutor,
    args: Vec<String>,
    feed_stdin: bool,
    verdicts: Vec<Verdict>,
}

impl FormatValidator {
    /// The stock checker for `format`: ImageMagick for images, ffprobe for audio/video, tshark for
    /// captures, timidity for MIDI and `unzip -t` for archives.
    pub fn for_format(format: FileFormat, timeout: Duration) -> Self {
        let (program, args, feed_stdin, verdicts): (&str, &[&str], bool, Vec<Verdict>) = match format
        {
            FileFormat::Bmp | FileFormat::Gif | FileFormat::Jpg | FileFormat::Png => (
                "identify",
                &["-verbose", FILE_PLACEHOLDER],
                false,
                vec![Verdict::StdoutContains("Elapsed")],
            ),
            FileFormat::Avi => (
                "ffprobe",
                &["-v", "error", "-show_format", "-show_streams", FILE_PLACEHOLDER],
                false,
                vec![
                    Verdict::StdoutContains("format_name"),
                    Verdict::StdoutContains("format_name=avi"),
                ],
            ),
            FileFormat::Wav | FileFormat::Mp3 | FileFormat::Mp4 => (
                "ffprobe",
                &["-v", "error", "-show_format", "-show_streams", FILE_PLACEHOLDER],
                false,
                vec![Verdict::StdoutContains("format_name")],
            ),
            FileFormat::Pcap => ("tshark", &["-r", FILE_PLACEHOLDER], false, vec![Verdict::ExitSuccess]),
            FileFormat::Midi => (
                "timidity",
                &["-", "-Ol", "-o", "/dev/null"],
                true,
                vec![Verdict::NoLineStartsWith("-:")],
            ),
            FileFormat::Zip => ("unzip", &["-tq", FILE_PLACEHOLDER], false, vec![Verdict::ExitSuccess]),
        };
        Self::build(
            program.to_string(),
            args.iter().map(|a| a.to_string()).collect(),
            feed_stdin,
            verdicts,
            timeout,
        )
    }

    /// A user-supplied argv; `{}` is replaced by the file path and exit status 0 means valid.
    /// Without a placeholder the path is appended.
    pub fn custom(argv: &[String], timeout: Duration) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        let mut args = rest.to_vec();
        if !args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
            args.push(FILE_PLACEHOLDER.to_string());
        }
        Some(Self::build(
            program.clone(),
            args,
            false,
            vec![Verdict::ExitSuccess],
            timeout,
        ))
    }

    /// The validator a run should use: the configured override if present, else the stock one.
    pub fn from_settings(format: FileFormat, settings: &ValidatorSettings) -> Self {
        let timeout = Duration::from_millis(settings.timeout_ms);
        settings
            .command
            .as_deref()
            .and_then(|argv| Self::custom(argv, timeout))
            .unwrap_or_else(|| Self::for_format(format, timeout))
    }

    fn build(
        program: String,
        args: Vec<String>,
        feed_stdin: bool,
        verdicts: Vec<Verdict>,
        timeout: Duration,
    ) -> Self {
        let capture_stdout = verdicts.iter().any(|v| *v != Verdict::ExitSuccess);
        Self {
            executor: CommandExecutor::new(CommandExecutorConfig {
                command: vec![program],
                timeout,
                working_dir: None,
                capture_stdout,
            }),
            args,
            feed_stdin,
            verdicts,
        }
    }
}

impl ValidityOracle for FormatValidator {
    fn is_valid(&self, file: &Path) -> bool {
        let path = file.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, &path))
            .collect();
        let stdin = if self.feed_stdin {
            match std::fs::read(file) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!("Error validating file {file:?}: {e}");
                    return false;
                }
            }
        } else {
            None
        };

        let output = self.executor.execute(&args, stdin);
        match &output.status {
            ExecutionStatus::Timeout => {
                tracing::debug!("Validator timed out on {file:?}");
                return false;
            }
            ExecutionStatus::Other(reason) => {
                tracing::warn!("Error validating file {file:?}: {reason}");
                return false;
            }
            ExecutionStatus::Ok | ExecutionStatus::Failed(_) => {}
        }

        let stdout = output.stdout_lossy();
        self.verdicts.iter().all(|verdict| match verdict {
            Verdict::ExitSuccess => output.is_success(),
            Verdict::StdoutContains(needle) => stdout.contains(needle),
            Verdict::NoLineStartsWith(prefix) => !stdout.lines().any(|l| l.starts_with(prefix)),
        })
    }
}
