use image::RgbaImage;
use serde::Serialize;
use tracing::{info, warn};

use super::catalog::BackgroundCatalog;
use super::executor::{ExecutionLog, ExecutionReport, PlanExecutor};
use super::extractor::PlanExtractor;
use super::fallback::fallback_plan;
use super::model_client::SharedModelClient;
use super::plan::Plan;
use super::planner::{build_prompt, InstructionPlanner};
use super::tool_adapters::SharedBackgroundRemover;

pub const EXAMPLE_INSTRUCTIONS: [&str; 5] = [
    "Remove the background",
    "Make background gold",
    "Replace with bg4 image in files",
    "Cut out the subject",
    "Detach the background",
];

pub const NOTICE_MODEL_SILENT: &str = "Using rule-based fallback (model did not respond)";
pub const NOTICE_UNPARSEABLE: &str = "Using rule-based fallback (could not parse JSON)";
pub const NOTICE_NO_ACTIONS: &str = "No actions planned. Try a different instruction.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Model,
    Fallback,
}

impl PlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanAnalysis {
    pub plan: Plan,
    pub source: PlanSource,
    pub notices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub plan: Plan,
    pub plan_source: PlanSource,
    pub planning_log: Vec<String>,
    pub execution_log: ExecutionLog,
    pub final_image: Option<RgbaImage>,
}

impl EditOutcome {
    pub fn succeeded(&self) -> bool {
        self.final_image.is_some()
    }
}

/// Instruction-to-image pipeline. Owns its collaborators; every call gets
/// fresh plan and pipeline state.
pub struct ImageEditAgent {
    planner: InstructionPlanner,
    remover: SharedBackgroundRemover,
    extractor: PlanExtractor,
}

impl ImageEditAgent {
    pub fn new(client: SharedModelClient, remover: SharedBackgroundRemover) -> Self {
        Self {
            planner: InstructionPlanner::new(client),
            remover,
            extractor: PlanExtractor::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: PlanExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn analyze_instruction(
        &self,
        instruction: &str,
        catalog: &BackgroundCatalog,
    ) -> PlanAnalysis {
        let mut notices = Vec::new();
        let prompt = build_prompt(instruction, catalog.entries());
        let raw = self.planner.invoke(prompt.as_str(), &mut notices);

        if raw.trim().is_empty() {
            warn!("model reply empty, using rule-based fallback");
            notices.push(String::from(NOTICE_MODEL_SILENT));
            return PlanAnalysis {
                plan: fallback_plan(instruction, catalog.entries()),
                source: PlanSource::Fallback,
                notices,
            };
        }

        match self.extractor.extract_with_strategy(raw.as_str()) {
            Some((plan, strategy)) => {
                info!(
                    strategy,
                    actions = plan.actions.len(),
                    "plan extracted from model reply"
                );
                PlanAnalysis {
                    plan,
                    source: PlanSource::Model,
                    notices,
                }
            }
            None => {
                warn!(chars = raw.len(), "model reply had no usable JSON plan");
                notices.push(String::from(NOTICE_UNPARSEABLE));
                PlanAnalysis {
                    plan: fallback_plan(instruction, catalog.entries()),
                    source: PlanSource::Fallback,
                    notices,
                }
            }
        }
    }

    pub fn execute_plan(
        &self,
        plan: &Plan,
        image_bytes: &[u8],
        catalog: &BackgroundCatalog,
    ) -> ExecutionReport {
        PlanExecutor::new(catalog, self.remover.as_ref()).execute(&plan.actions, image_bytes)
    }

    pub fn process(
        &self,
        instruction: &str,
        image_bytes: &[u8],
        catalog: &BackgroundCatalog,
    ) -> EditOutcome {
        let PlanAnalysis {
            plan,
            source,
            mut notices,
        } = self.analyze_instruction(instruction, catalog);
        if plan.actions.is_empty() {
            notices.push(String::from(NOTICE_NO_ACTIONS));
        }
        let report = self.execute_plan(&plan, image_bytes, catalog);
        info!(
            plan_source = source.as_str(),
            actions = plan.actions.len(),
            produced_image = report.final_image.is_some(),
            "edit processed"
        );
        EditOutcome {
            plan,
            plan_source: source,
            planning_log: notices,
            execution_log: report.log,
            final_image: report.final_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compositor::encode_png;
    use crate::pipeline::model_client::{ExternalModelClient, ModelInvocationError};
    use crate::pipeline::plan::ActionKind;
    use crate::pipeline::tool_adapters::{BackgroundRemover, ToolAdapterError};
    use image::Rgba;
    use std::sync::{Arc, Mutex};

    struct CannedClient {
        reply: Result<String, u64>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn timing_out(secs: u64) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(secs),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    impl ExternalModelClient for CannedClient {
        fn generate(&self, prompt: &str) -> Result<String, ModelInvocationError> {
            self.prompts
                .lock()
                .expect("client mutex poisoned")
                .push(prompt.to_string());
            self.reply
                .clone()
                .map_err(|timeout_secs| ModelInvocationError::Timeout { timeout_secs })
        }
    }

    struct KeepAll;

    impl BackgroundRemover for KeepAll {
        fn remove(&self, image_bytes: &[u8]) -> Result<Vec<u8>, ToolAdapterError> {
            Ok(image_bytes.to_vec())
        }
    }

    fn catalog_with(entries: &[&str]) -> BackgroundCatalog {
        BackgroundCatalog::from_entries(
            std::env::temp_dir().join("backdrop_agent_none"),
            entries.iter().map(|e| e.to_string()).collect(),
        )
    }

    fn subject() -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(5, 3, Rgba([0, 0, 0, 0]))).expect("fixture encodes")
    }

    #[test]
    fn fenced_model_reply_is_used_as_plan() {
        let client = CannedClient::replying(
            "Sure!\n```json\n{\"actions\":[{\"type\":\"remove_background\",\"confidence\":0.9},{\"type\":\"set_background_color\",\"params\":{\"color\":\"gold\"},\"confidence\":0.8}],\"reasoning\":\"gold\",\"warnings\":[]}\n```",
        );
        let agent = ImageEditAgent::new(client.clone(), Arc::new(KeepAll));
        let analysis = agent.analyze_instruction("Make background gold", &catalog_with(&["bg4.png"]));

        assert_eq!(analysis.source, PlanSource::Model);
        assert!(analysis.notices.is_empty());
        assert_eq!(analysis.plan.actions.len(), 2);
        assert_eq!(analysis.plan.reasoning, "gold");
        let prompts = client.prompts.lock().expect("client mutex poisoned");
        assert!(prompts[0].contains("Available backgrounds: bg4.png"));
    }

    #[test]
    fn model_failure_falls_back_with_notices() {
        let agent = ImageEditAgent::new(CannedClient::timing_out(120), Arc::new(KeepAll));
        let analysis =
            agent.analyze_instruction("Replace with bg4 image in files", &catalog_with(&["bg4.png"]));

        assert_eq!(analysis.source, PlanSource::Fallback);
        assert_eq!(
            analysis.notices,
            vec![
                String::from("Model error: model call timed out after 120s"),
                String::from(NOTICE_MODEL_SILENT),
            ]
        );
        assert_eq!(analysis.plan.actions[1].kind, ActionKind::ReplaceBackground);
        assert_eq!(analysis.plan.actions[1].param_str("source"), Some("bg4.png"));
    }

    #[test]
    fn prose_reply_falls_back_as_unparseable() {
        let agent = ImageEditAgent::new(
            CannedClient::replying("I think you should remove the background."),
            Arc::new(KeepAll),
        );
        let analysis = agent.analyze_instruction("Detach the background", &catalog_with(&[]));
        assert_eq!(analysis.source, PlanSource::Fallback);
        assert_eq!(analysis.notices, vec![String::from(NOTICE_UNPARSEABLE)]);
        assert_eq!(analysis.plan.actions[0].kind, ActionKind::RemoveBackground);
    }

    #[test]
    fn custom_extractor_chain_is_honoured() {
        use crate::pipeline::extractor::{PlanExtractor, WholeDocumentStrategy};

        let agent = ImageEditAgent::new(
            CannedClient::replying(
                "```json\n{\"actions\":[{\"type\":\"remove_background\"}]}\n```",
            ),
            Arc::new(KeepAll),
        )
        .with_extractor(PlanExtractor::new(vec![Box::new(WholeDocumentStrategy)]));
        let analysis = agent.analyze_instruction("erase it", &catalog_with(&[]));

        assert_eq!(analysis.source, PlanSource::Fallback);
        assert_eq!(analysis.notices, vec![String::from(NOTICE_UNPARSEABLE)]);
    }

    #[test]
    fn process_runs_plan_and_reports_logs() {
        let agent = ImageEditAgent::new(
            CannedClient::replying(
                r#"{"actions":[{"type":"remove_background"},{"type":"set_background_color","params":{"color":"blue"}}]}"#,
            ),
            Arc::new(KeepAll),
        );
        let outcome = agent.process("blue please", subject().as_slice(), &catalog_with(&[]));

        assert!(outcome.succeeded());
        assert_eq!(outcome.plan_source, PlanSource::Model);
        assert_eq!(outcome.execution_log.len(), 3);
        let image = outcome.final_image.expect("image");
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(*image.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn empty_plan_still_composites_with_notice() {
        let agent = ImageEditAgent::new(
            CannedClient::replying(r#"{"actions":[],"reasoning":"nothing to do"}"#),
            Arc::new(KeepAll),
        );
        let outcome = agent.process("hello", subject().as_slice(), &catalog_with(&[]));

        assert_eq!(outcome.planning_log, vec![String::from(NOTICE_NO_ACTIONS)]);
        assert_eq!(
            outcome.execution_log.entries(),
            &[String::from("Final composition completed")][..]
        );
        let image = outcome.final_image.expect("image");
        assert_eq!(*image.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
    }
}
