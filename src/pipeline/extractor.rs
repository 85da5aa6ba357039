use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::plan::{is_plan_shaped, Plan};

/// One way of locating a JSON object inside a model reply.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Option<Map<String, Value>>;
}

pub struct WholeDocumentStrategy;

impl ExtractionStrategy for WholeDocumentStrategy {
    fn name(&self) -> &'static str {
        "whole_document"
    }

    fn extract(&self, text: &str) -> Option<Map<String, Value>> {
        parse_object(text)
    }
}

/// Brace-balanced objects with at most one level of nesting.
pub struct BalancedBraceStrategy;

impl ExtractionStrategy for BalancedBraceStrategy {
    fn name(&self) -> &'static str {
        "balanced_braces"
    }

    fn extract(&self, text: &str) -> Option<Map<String, Value>> {
        balanced_object_regex()
            .find_iter(text)
            .filter_map(|m| parse_plan_candidate(m.as_str()))
            .next()
    }
}

pub struct FencedBlockStrategy;

impl ExtractionStrategy for FencedBlockStrategy {
    fn name(&self) -> &'static str {
        "fenced_block"
    }

    fn extract(&self, text: &str) -> Option<Map<String, Value>> {
        fenced_block_regex()
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| parse_plan_candidate(m.as_str()))
            .next()
    }
}

pub struct OutermostBracesStrategy;

impl ExtractionStrategy for OutermostBracesStrategy {
    fn name(&self) -> &'static str {
        "outermost_braces"
    }

    fn extract(&self, text: &str) -> Option<Map<String, Value>> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        parse_plan_candidate(&text[start..=end])
    }
}

pub struct PlanExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Default for PlanExtractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(WholeDocumentStrategy),
            Box::new(BalancedBraceStrategy),
            Box::new(FencedBlockStrategy),
            Box::new(OutermostBracesStrategy),
        ])
    }
}

impl PlanExtractor {
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, raw: &str) -> Option<Plan> {
        self.extract_with_strategy(raw).map(|(plan, _)| plan)
    }

    /// Like [`PlanExtractor::extract`], also naming the strategy that matched.
    pub fn extract_with_strategy(&self, raw: &str) -> Option<(Plan, &'static str)> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        for strategy in &self.strategies {
            if let Some(obj) = strategy.extract(text) {
                debug!(strategy = strategy.name(), "extracted plan object from model reply");
                return Some((Plan::from_object(obj), strategy.name()));
            }
        }
        debug!(chars = text.len(), "no plan object found in model reply");
        None
    }
}

fn parse_plan_candidate(candidate: &str) -> Option<Map<String, Value>> {
    parse_object(candidate).filter(is_plan_shaped)
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(candidate).ok().or_else(|| {
        let repaired = strip_trailing_commas(candidate);
        serde_json::from_str::<Value>(repaired.as_str()).ok()
    })?;
    match parsed {
        Value::Object(obj) => Some(obj),
        _ => None,
    }
}

fn balanced_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("balanced object regex is valid")
    })
}

fn fenced_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced block regex is valid")
    })
}

/// Drops commas that directly precede `}` or `]`, leaving string literals
/// untouched.
fn strip_trailing_commas(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = candidate.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => in_string = true,
            ',' => {
                let next = candidate[idx + 1..].trim_start().chars().next();
                if matches!(next, Some('}' | ']')) {
                    continue;
                }
            }
            _ => {}
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::plan::{Action, ActionKind, DEFAULT_REASONING};

    const PLAN_JSON: &str = r#"{
  "actions": [
    {"type": "remove_background", "confidence": 0.9},
    {"type": "replace_background", "params": {"source": "bg1.jpg"}, "confidence": 0.85}
  ],
  "reasoning": "Use the beach image.",
  "warnings": []
}"#;

    fn expected_plan() -> Plan {
        Plan {
            actions: vec![
                Action::remove_background(0.9),
                Action::replace_background("bg1.jpg", 0.85),
            ],
            reasoning: String::from("Use the beach image."),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn equivalent_wrappings_extract_the_same_plan() {
        let extractor = PlanExtractor::default();
        let variants = [
            PLAN_JSON.to_string(),
            format!("\n\n   {PLAN_JSON}   \n"),
            format!("```json\n{PLAN_JSON}\n```"),
            format!("```\n{PLAN_JSON}\n```"),
            format!("Sure! Here is the plan:\n{PLAN_JSON}\nLet me know if you need more."),
            format!("Here you go:\n```json\n{PLAN_JSON}\n```\nDone."),
        ];
        for variant in variants {
            assert_eq!(
                extractor.extract(variant.as_str()),
                Some(expected_plan()),
                "variant failed: {variant}"
            );
        }
    }

    #[test]
    fn returns_none_for_plain_prose() {
        let extractor = PlanExtractor::default();
        assert_eq!(extractor.extract("not json at all"), None);
        assert_eq!(extractor.extract(""), None);
        assert_eq!(extractor.extract("   "), None);
        assert_eq!(extractor.extract("{ broken"), None);
    }

    #[test]
    fn minimal_plan_gets_defaults() {
        let plan = PlanExtractor::default()
            .extract(r#"{"actions":[{"type":"remove_background"}]}"#)
            .expect("plan should extract");
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::RemoveBackground);
        assert_eq!(plan.actions[0].confidence, 0.5);
        assert_eq!(plan.reasoning, DEFAULT_REASONING);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn balanced_strategy_handles_one_level_of_nesting_in_prose() {
        let (plan, strategy) = PlanExtractor::default()
            .extract_with_strategy(
                r#"Plan: {"actions": [{"type": "remove_background"}], "reasoning": "cut"} ok"#,
            )
            .expect("plan should extract");
        assert_eq!(strategy, "balanced_braces");
        assert_eq!(plan.reasoning, "cut");
    }

    #[test]
    fn inner_action_objects_do_not_mask_the_plan() {
        let (plan, strategy) = PlanExtractor::default()
            .extract_with_strategy(format!("Answer follows. {PLAN_JSON} (end)").as_str())
            .expect("plan should extract");
        assert_eq!(strategy, "outermost_braces");
        assert_eq!(plan, expected_plan());
    }

    #[test]
    fn repairs_trailing_commas() {
        let plan = PlanExtractor::default()
            .extract(r#"{"actions": [{"type": "remove_background",},], "warnings": [],}"#)
            .expect("plan should extract after repair");
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn comma_repair_leaves_string_values_alone() {
        let plan = PlanExtractor::default()
            .extract(
                r#"{"actions":[], "reasoning": "keep [a, ] and {b, } and \"c, ]\"", "warnings":[],}"#,
            )
            .expect("plan should extract after repair");
        assert_eq!(plan.reasoning, r#"keep [a, ] and {b, } and "c, ]""#);
        assert_eq!(
            strip_trailing_commas(r#"{"a": [1, 2 ,] , "b": "x,}" ,}"#),
            r#"{"a": [1, 2 ] , "b": "x,}" }"#
        );
    }

    #[test]
    fn non_object_json_falls_through() {
        assert_eq!(PlanExtractor::default().extract("[1, 2, 3]"), None);
        assert_eq!(PlanExtractor::default().extract("\"just a string\""), None);
    }

    #[test]
    fn custom_strategy_chain_is_respected() {
        let extractor = PlanExtractor::new(vec![Box::new(FencedBlockStrategy)]);
        assert_eq!(extractor.extract(PLAN_JSON), None);
        assert!(extractor
            .extract(format!("```json\n{PLAN_JSON}\n```").as_str())
            .is_some());
    }
}
