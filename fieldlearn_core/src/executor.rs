use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    /// Exited non-zero or was killed by a signal.
    Failed(String),
    /// Could not be spawned or waited on.
    Other(String),
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExecutionStatus,
    pub stdout: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    fn from_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            stdout: Vec::new(),
            exit_code: None,
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

pub struct CommandExecutorConfig {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub capture_stdout: bool,
}

/// Runs an external tool synchronously with a wall-clock bound.
///
/// stderr is discarded; stdout is drained on a helper thread when captured so a chatty child cannot
/// block on a full pipe.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn command(&self) -> &[String] {
        &self.config.command
    }

    /// Runs the configured command followed by `args`, optionally feeding `stdin`.
    pub fn execute(&self, args: &[String], stdin: Option<Vec<u8>>) -> ProcessOutput {
        let Some((program, leading)) = self.config.command.split_first() else {
            return ProcessOutput::from_status(ExecutionStatus::Other(
                "Empty command line".to_string(),
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(leading).args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if self.config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn command '{program}': {e}");
                tracing::debug!("{error_msg}");
                return ProcessOutput::from_status(ExecutionStatus::Other(error_msg));
            }
        };

        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => Some(std::thread::spawn(move || {
                // The child may exit without reading everything; a broken pipe is not an error here.
                let _ = pipe.write_all(&bytes);
            })),
            _ => None,
        };
        let reader: Option<JoinHandle<Vec<u8>>> = child.stdout.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let exit = run_and_wait_with_timeout(child, self.config.timeout);
        if let Some(handle) = writer {
            let _ = handle.join();
        }

        match exit {
            Ok(status) => {
                let stdout = reader
                    .and_then(|handle| handle.join().ok())
                    .unwrap_or_default();
                let (exit_code, signal) = exit_details(&status);
                let status = if status.success() {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::Failed(describe_exit(exit_code, signal))
                };
                ProcessOutput {
                    status,
                    stdout,
                    exit_code,
                    signal,
                }
            }
            // On timeout the reader is left detached: a grandchild may still hold the pipe open.
            Err(status) => ProcessOutput::from_status(status),
        }
    }
}

fn run_and_wait_with_timeout(mut child: Child, timeout: Duration) -> Result<ExitStatus, ExecutionStatus> {
    let start_time = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    tracing::debug!("Child process timed out after {timeout:?}, killing");
                    if let Err(e) = child.kill() {
                        return Err(ExecutionStatus::Other(format!(
                            "Failed to kill timed-out process: {e}"
                        )));
                    }
                    let _ = child.wait();
                    return Err(ExecutionStatus::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(ExecutionStatus::Other(format!(
                    "Error waiting for child: {e}"
                )));
            }
        }
    }
}

fn exit_details(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("Exited with code {code}"),
        (None, Some(signal)) => format!("Terminated by signal {signal}"),
        (None, None) => "Exited abnormally".to_string(),
    }
}
