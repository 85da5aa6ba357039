pub mod agent;
pub mod catalog;
pub mod color;
pub mod compositor;
pub mod executor;
pub mod extractor;
pub mod fallback;
pub mod model_client;
pub mod plan;
pub mod planner;
pub mod runtime;
pub mod settings_layer;
pub mod tool_adapters;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agent::ImageEditAgent;
use model_client::OllamaCliClient;
use settings_layer::AgentSettings;
use tool_adapters::RembgBackgroundRemover;

/// Wires the production collaborators (ollama CLI, rembg subprocess) from
/// resolved settings.
pub fn build_default_agent(app_root: &Path, settings: &AgentSettings) -> ImageEditAgent {
    let client = OllamaCliClient::with_defaults(app_root)
        .with_binary(settings.model_binary.as_str())
        .with_model(settings.model_name.as_str())
        .with_timeout(Duration::from_secs(settings.model_timeout_secs));
    let remover = RembgBackgroundRemover::with_defaults()
        .with_python_bin(settings.rembg_python.as_str())
        .with_model(settings.rembg_model.as_str());
    ImageEditAgent::new(Arc::new(client), Arc::new(remover))
}
