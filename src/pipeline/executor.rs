use std::error::Error as StdError;
use std::path::PathBuf;

use image::{Rgba, RgbaImage};
use serde::Serialize;
use tracing::{error, info, warn};

use super::catalog::BackgroundCatalog;
use super::color::{resolve_color, ColorError};
use super::compositor::composite;
use super::plan::{format_confidence, Action, ActionKind};
use super::tool_adapters::{BackgroundRemover, ToolAdapterError};

/// Append-only, user-visible record of what the executor did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExecutionLog {
    entries: Vec<String>,
}

impl ExecutionLog {
    pub fn entries(&self) -> &[String] {
        self.entries.as_slice()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    fn info(&mut self, message: String) {
        info!(entry = %message, "execution");
        self.entries.push(message);
    }

    fn warn(&mut self, message: String) {
        warn!(entry = %message, "execution");
        self.entries.push(format!("Warning: {message}"));
    }

    pub(crate) fn error(&mut self, message: String) {
        error!(entry = %message, "execution");
        self.entries.push(format!("Error: {message}"));
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub final_image: Option<RgbaImage>,
    pub log: ExecutionLog,
}

struct PipelineState {
    current_image_bytes: Vec<u8>,
    selected_background_path: Option<PathBuf>,
    selected_background_color: Option<Rgba<u8>>,
}

enum StepError {
    BackgroundRemoval(ToolAdapterError),
}

/// Runs a plan against one image. Borrowed collaborators are fixed for the
/// lifetime of the executor; state lives only inside [`PlanExecutor::execute`].
pub struct PlanExecutor<'a> {
    catalog: &'a BackgroundCatalog,
    remover: &'a dyn BackgroundRemover,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(catalog: &'a BackgroundCatalog, remover: &'a dyn BackgroundRemover) -> Self {
        Self { catalog, remover }
    }

    pub fn execute(&self, actions: &[Action], image_bytes: &[u8]) -> ExecutionReport {
        let mut state = PipelineState {
            current_image_bytes: image_bytes.to_vec(),
            selected_background_path: None,
            selected_background_color: None,
        };
        let mut log = ExecutionLog::default();

        for (idx, action) in actions.iter().enumerate() {
            info!(
                action_index = idx + 1,
                action = action.kind.as_str(),
                confidence = action.confidence,
                "executing action"
            );
            if let Err(err) = self.apply(action, &mut state, &mut log) {
                let StepError::BackgroundRemoval(source) = err;
                log.error(format!(
                    "Error in {}: {}",
                    action.kind.as_str(),
                    describe_error(&source)
                ));
            }
        }

        match composite(
            state.current_image_bytes.as_slice(),
            state.selected_background_path.as_deref(),
            state.selected_background_color,
        ) {
            Ok(image) => {
                log.info(String::from("Final composition completed"));
                ExecutionReport {
                    final_image: Some(image),
                    log,
                }
            }
            Err(err) => {
                log.error(format!("Error in final composition: {}", describe_error(&err)));
                ExecutionReport {
                    final_image: None,
                    log,
                }
            }
        }
    }

    fn apply(
        &self,
        action: &Action,
        state: &mut PipelineState,
        log: &mut ExecutionLog,
    ) -> Result<(), StepError> {
        let confidence = format_confidence(action.confidence);
        match &action.kind {
            ActionKind::RemoveBackground => {
                log.info(format!("Removing background (confidence: {confidence})"));
                state.current_image_bytes = self
                    .remover
                    .remove(state.current_image_bytes.as_slice())
                    .map_err(StepError::BackgroundRemoval)?;
            }
            ActionKind::ReplaceBackground => match action.param_str("source") {
                Some(requested) => match self.catalog.match_by_name(requested) {
                    Some(entry) => {
                        state.selected_background_path = Some(self.catalog.path_for(entry));
                        log.info(format!(
                            "Setting background to {entry} (confidence: {confidence})"
                        ));
                    }
                    None => log.warn(format!(
                        "Background {requested} not found (tried to match by name)"
                    )),
                },
                None => log.warn(String::from(
                    "No background file specified for replace_background",
                )),
            },
            ActionKind::SetBackgroundColor => match action.param_str("color") {
                Some(color) => match resolve_color(color) {
                    Ok(rgba) => {
                        state.selected_background_color = Some(rgba);
                        log.info(format!(
                            "Setting background color to {color} (confidence: {confidence})"
                        ));
                    }
                    Err(ColorError::InvalidColor { input }) => log.warn(format!(
                        "Invalid color {input}, background color left unchanged"
                    )),
                },
                None => log.warn(String::from(
                    "No color specified for set_background_color",
                )),
            },
            ActionKind::Unknown(_) => {
                log.warn(format!("Unknown action type: {}", action.kind.as_str()));
            }
        }
        Ok(())
    }
}

fn describe_error(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(cause.to_string().as_str());
        source = cause.source();
    }
    out
}
