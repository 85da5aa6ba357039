use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait PipelineCommandRunner: Send + Sync + 'static {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError>;
}

#[derive(Debug, Default, Clone)]
pub struct StdPipelineCommandRunner;

impl PipelineCommandRunner for StdPipelineCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, PipelineRuntimeError> {
        let mut command = Command::new(spec.program.as_str());
        command
            .args(spec.args.iter().map(String::as_str))
            .current_dir(spec.cwd.as_path())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console_window(&mut command);

        let mut child = command.spawn().map_err(|source| PipelineRuntimeError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // stdin is fed from its own thread so a chatty child cannot deadlock
        // against a full stdout pipe.
        let stdin_writer = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(thread::spawn(move || {
                let _ = pipe.write_all(input.as_bytes());
            })),
            _ => None,
        };
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let status = match spec.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(PipelineRuntimeError::Io)? {
                Some(status) => status,
                None => {
                    kill_and_reap(&mut child);
                    return Err(PipelineRuntimeError::TimedOut {
                        program: spec.program.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            None => child.wait().map_err(PipelineRuntimeError::Io)?,
        };

        if let Some(handle) = stdin_writer {
            let _ = handle.join();
        }
        Ok(CommandOutput {
            status_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(join_reader(stdout_reader).as_slice()).to_string(),
            stderr: String::from_utf8_lossy(join_reader(stderr_reader).as_slice()).to_string(),
        })
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(windows)]
fn hide_console_window(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_command: &mut Command) {}

#[derive(Debug, Error)]
pub enum PipelineRuntimeError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command execution failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("'{program}' timed out after {timeout_secs}s")]
    TimedOut { program: String, timeout_secs: u64 },
}

pub fn default_app_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", std::env::temp_dir())
            .arg("-c")
            .arg(script)
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let output = StdPipelineCommandRunner
            .run(&sh("echo out; echo err 1>&2; exit 3"))
            .expect("command should run");
        assert_eq!(output.status_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn feeds_stdin_to_the_child() {
        let output = StdPipelineCommandRunner
            .run(&sh("cat").with_stdin("hello prompt"))
            .expect("command should run");
        assert_eq!(output.status_code, 0);
        assert_eq!(output.stdout, "hello prompt");
    }

    #[test]
    fn enforces_timeout() {
        let err = StdPipelineCommandRunner
            .run(&sh("sleep 5").with_timeout(Duration::from_millis(200)))
            .expect_err("command should time out");
        assert!(matches!(err, PipelineRuntimeError::TimedOut { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = StdPipelineCommandRunner
            .run(&CommandSpec::new(
                "backdrop-agent-definitely-missing-binary",
                std::env::temp_dir(),
            ))
            .expect_err("spawn should fail");
        assert!(matches!(err, PipelineRuntimeError::Spawn { .. }));
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("ollama", ".").arg("run").arg("gemma:2b");
        assert_eq!(spec.display(), "ollama run gemma:2b");
    }
}
