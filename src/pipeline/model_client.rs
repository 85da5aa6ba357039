use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::runtime::{
    CommandSpec, PipelineCommandRunner, PipelineRuntimeError, StdPipelineCommandRunner,
};

pub const DEFAULT_MODEL_BINARY: &str = "ollama";
pub const DEFAULT_MODEL_NAME: &str = "gemma:2b";
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ModelInvocationError {
    #[error("model call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
    #[error("model process '{program}' exited with code {status_code}: {stderr}")]
    NonZeroExit {
        program: String,
        status_code: i32,
        stderr: String,
    },
    #[error("model process could not be run: {0}")]
    Runner(#[source] PipelineRuntimeError),
}

/// Text generation by a locally hosted language model.
pub trait ExternalModelClient: Send + Sync + 'static {
    fn generate(&self, prompt: &str) -> Result<String, ModelInvocationError>;
}

pub type SharedModelClient = Arc<dyn ExternalModelClient>;

/// Runs `<binary> run <model>` with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct OllamaCliClient<R> {
    binary: String,
    model: String,
    timeout: Duration,
    cwd: PathBuf,
    runner: R,
}

impl OllamaCliClient<StdPipelineCommandRunner> {
    pub fn with_defaults(cwd: impl Into<PathBuf>) -> Self {
        Self::new(cwd, StdPipelineCommandRunner)
    }
}

impl<R> OllamaCliClient<R> {
    pub fn new(cwd: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            binary: String::from(DEFAULT_MODEL_BINARY),
            model: String::from(DEFAULT_MODEL_NAME),
            timeout: Duration::from_secs(DEFAULT_MODEL_TIMEOUT_SECS),
            cwd: cwd.into(),
            runner,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build_command(&self, prompt: &str) -> CommandSpec {
        CommandSpec::new(self.binary.as_str(), self.cwd.as_path())
            .arg("run")
            .arg(self.model.as_str())
            .with_stdin(prompt)
            .with_timeout(self.timeout)
    }
}

impl<R> ExternalModelClient for OllamaCliClient<R>
where
    R: PipelineCommandRunner,
{
    fn generate(&self, prompt: &str) -> Result<String, ModelInvocationError> {
        let spec = self.build_command(prompt);
        info!(command = %spec.display(), "invoking language model");
        let output = self.runner.run(&spec).map_err(|err| match err {
            PipelineRuntimeError::TimedOut { timeout_secs, .. } => {
                ModelInvocationError::Timeout { timeout_secs }
            }
            other => ModelInvocationError::Runner(other),
        })?;
        info!(status_code = output.status_code, "language model exited");
        debug!(stdout = %output.stdout, stderr = %output.stderr, "language model streams");
        if output.status_code != 0 {
            return Err(ModelInvocationError::NonZeroExit {
                program: self.binary.clone(),
                status_code: output.status_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.trim().to_string())
    }
}
