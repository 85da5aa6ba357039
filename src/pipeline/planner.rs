use tracing::{debug, warn};

use super::model_client::SharedModelClient;

/// Builds the planning prompt. The catalog filenames are listed verbatim so
/// the model can only reference backgrounds that actually exist.
pub fn build_prompt(instruction: &str, catalog: &[String]) -> String {
    let available = if catalog.is_empty() {
        String::from("none")
    } else {
        catalog.join(", ")
    };
    format!(
        r#"You are an expert image editing assistant. Find the user's exact intent even when the request is indirect, oddly worded, or uses color adjectives such as "greener" or "reddish".
Respond with ONLY one valid JSON object (no markdown, no extra text). The object must have exactly three top-level keys: "actions" (an array), "reasoning" (a string) and "warnings" (an array). Never put "reasoning" or "warnings" inside "actions" or any other array.

Instruction: "{instruction}"

Available action types: remove_background, replace_background, set_background_color

When to use each action:
- remove_background: the instruction asks to remove, erase, cut out or make the background transparent. Whenever removal is implied it must be the first action.
- replace_background: only when the instruction refers to a file from the available backgrounds list. Put that filename in "params": {{"source": "<filename>"}}.
- set_background_color: the instruction asks for a specific background color. Put a standard color name or a #rrggbb hex code in "params": {{"color": "<color>"}}. Before choosing it, check whether the word matches a file in the available backgrounds list; if it does, use replace_background instead.
- Never choose both replace_background and set_background_color.

Example (remove background):
{{"actions": [{{"type": "remove_background", "confidence": 0.9}}], "reasoning": "The instruction asks to remove the background.", "warnings": []}}

Example (replace background):
{{"actions": [{{"type": "remove_background", "confidence": 0.9}}, {{"type": "replace_background", "params": {{"source": "bg1.jpg"}}, "confidence": 0.85}}], "reasoning": "The instruction asks to use a specific background image.", "warnings": []}}

Example (set background color):
{{"actions": [{{"type": "remove_background", "confidence": 0.9}}, {{"type": "set_background_color", "params": {{"color": "green"}}, "confidence": 0.8}}], "reasoning": "The instruction asks to change the background color.", "warnings": []}}

Available backgrounds: {available}
"#
    )
}

pub struct InstructionPlanner {
    client: SharedModelClient,
}

impl InstructionPlanner {
    pub fn new(client: SharedModelClient) -> Self {
        Self { client }
    }

    /// Returns the raw model reply, or an empty string when the model could
    /// not be run. The failure is appended to `notices` instead of returned.
    pub fn invoke(&self, prompt: &str, notices: &mut Vec<String>) -> String {
        debug!(prompt = %prompt, "planning prompt");
        match self.client.generate(prompt) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "language model invocation failed");
                notices.push(format!("Model error: {err}"));
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model_client::{ExternalModelClient, ModelInvocationError};
    use std::sync::Arc;

    struct FailingClient;

    impl ExternalModelClient for FailingClient {
        fn generate(&self, _prompt: &str) -> Result<String, ModelInvocationError> {
            Err(ModelInvocationError::Timeout { timeout_secs: 45 })
        }
    }

    struct EchoClient;

    impl ExternalModelClient for EchoClient {
        fn generate(&self, prompt: &str) -> Result<String, ModelInvocationError> {
            Ok(format!("echo:{}", prompt.len()))
        }
    }

    #[test]
    fn prompt_embeds_instruction_catalog_and_contract() {
        let prompt = build_prompt(
            "Replace with bg4",
            &[String::from("bg4.png"), String::from("beach.jpg")],
        );
        assert!(prompt.contains("Instruction: \"Replace with bg4\""));
        assert!(prompt.contains("Available backgrounds: bg4.png, beach.jpg"));
        assert!(prompt.contains("\"actions\" (an array), \"reasoning\" (a string) and \"warnings\" (an array)"));
        assert!(prompt.contains("Never choose both replace_background and set_background_color"));
        assert!(prompt.contains("remove_background, replace_background, set_background_color"));
        assert!(prompt.contains(r#""params": {"source": "bg1.jpg"}"#));
    }

    #[test]
    fn prompt_lists_none_for_empty_catalog() {
        let prompt = build_prompt("make it blue", &[]);
        assert!(prompt.contains("Available backgrounds: none"));
    }

    #[test]
    fn invoke_swallows_failures_into_notices() {
        let planner = InstructionPlanner::new(Arc::new(FailingClient));
        let mut notices = Vec::new();
        let raw = planner.invoke("prompt", &mut notices);
        assert_eq!(raw, "");
        assert_eq!(
            notices,
            vec![String::from("Model error: model call timed out after 45s")]
        );
    }

    #[test]
    fn invoke_returns_model_text() {
        let planner = InstructionPlanner::new(Arc::new(EchoClient));
        let mut notices = Vec::new();
        assert_eq!(planner.invoke("abc", &mut notices), "echo:3");
        assert!(notices.is_empty());
    }
}
