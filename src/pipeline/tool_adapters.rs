use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::pipeline::runtime::{
    CommandSpec, PipelineCommandRunner, PipelineRuntimeError, StdPipelineCommandRunner,
};

pub const DEFAULT_REMBG_PYTHON: &str = "python3";
pub const DEFAULT_REMBG_MODEL: &str = "u2net";

const REMBG_INLINE_PYTHON: &str = r#"
import argparse
from pathlib import Path

def fail(message: str) -> None:
    raise SystemExit(message)

def main():
    parser = argparse.ArgumentParser(description="Remove image background with rembg")
    parser.add_argument("--input", required=True, help="Input image file")
    parser.add_argument("--output", required=True, help="Output PNG file")
    parser.add_argument("--model", default="u2net", help="rembg model name")
    args = parser.parse_args()

    input_path = Path(args.input).resolve()
    output_path = Path(args.output).resolve()
    if not input_path.is_file():
        fail(f"Input file not found: {input_path}")

    try:
        from rembg import remove, new_session
    except Exception as exc:
        fail(f"rembg runtime is missing. Install it with: pip install rembg\nOriginal error: {exc}")

    session = new_session(args.model)
    output_path.parent.mkdir(parents=True, exist_ok=True)
    output_path.write_bytes(remove(input_path.read_bytes(), session=session))

main()
"#;

/// Opaque segmentation capability: image bytes in, subject with a
/// transparent background out (PNG).
pub trait BackgroundRemover: Send + Sync + 'static {
    fn remove(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ToolAdapterError>;
}

pub type SharedBackgroundRemover = Arc<dyn BackgroundRemover>;

#[derive(Debug, Clone)]
pub struct RembgBackgroundRemover<R> {
    python_bin: String,
    model: String,
    work_dir: PathBuf,
    runner: R,
}

impl RembgBackgroundRemover<StdPipelineCommandRunner> {
    pub fn with_defaults() -> Self {
        Self::new(std::env::temp_dir(), StdPipelineCommandRunner)
    }
}

impl<R> RembgBackgroundRemover<R> {
    pub fn new(work_dir: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            python_bin: String::from(DEFAULT_REMBG_PYTHON),
            model: String::from(DEFAULT_REMBG_MODEL),
            work_dir: work_dir.into(),
            runner,
        }
    }

    pub fn with_python_bin(mut self, python_bin: impl Into<String>) -> Self {
        self.python_bin = python_bin.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn build_command(&self, input: &std::path::Path, output: &std::path::Path) -> CommandSpec {
        CommandSpec::new(self.python_bin.as_str(), self.work_dir.as_path())
            .arg("-c")
            .arg(REMBG_INLINE_PYTHON)
            .arg("--input")
            .arg(input.to_string_lossy())
            .arg("--output")
            .arg(output.to_string_lossy())
            .arg("--model")
            .arg(self.model.as_str())
    }
}

impl<R> BackgroundRemover for RembgBackgroundRemover<R>
where
    R: PipelineCommandRunner,
{
    fn remove(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ToolAdapterError> {
        let scratch = self
            .work_dir
            .join(format!("backdrop_bgremove_{}", Uuid::new_v4()));
        fs::create_dir_all(scratch.as_path()).map_err(ToolAdapterError::Io)?;
        let input = scratch.join("input.img");
        let output = scratch.join("output.png");

        let result = (|| {
            fs::write(input.as_path(), image_bytes).map_err(ToolAdapterError::Io)?;
            let spec = self.build_command(input.as_path(), output.as_path());
            info!(program = %self.python_bin, model = %self.model, "running rembg background removal");
            let out = self.runner.run(&spec).map_err(ToolAdapterError::CommandRunner)?;
            if out.status_code != 0 {
                return Err(ToolAdapterError::CommandFailed {
                    program: self.python_bin.clone(),
                    status_code: out.status_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                });
            }
            if !output.is_file() {
                return Err(ToolAdapterError::Native(String::from(
                    "rembg finished without writing an output image",
                )));
            }
            fs::read(output.as_path()).map_err(ToolAdapterError::Io)
        })();

        let _ = fs::remove_dir_all(scratch.as_path());
        result
    }
}

#[derive(Debug, Error)]
pub enum ToolAdapterError {
    #[error("tool adapter command runner error: {0}")]
    CommandRunner(#[source] PipelineRuntimeError),
    #[error("tool adapter command failed ({program}) with exit code {status_code}: {stderr}")]
    CommandFailed {
        program: String,
        status_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("tool adapter filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("{0}")]
    Native(String),
}
