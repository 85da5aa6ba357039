use std::sync::OnceLock;

use regex::Regex;

use super::catalog::stem_key;
use super::color::named_colors;
use super::plan::{Action, Plan};

pub const FALLBACK_REASONING: &str = "Rule-based parsing used";

const REMOVE_KEYWORDS: &[&str] = &[
    "remove",
    "cut out",
    "transparent",
    "detach",
    "extract",
    "isolate",
    "separate",
    "erase",
    "no background",
    "without background",
];

const REPLACE_KEYWORDS: &[&str] = &[
    "replace background",
    "change background",
    "set background",
    "make background",
    "embed background",
    "modify background",
    "replace with",
    "replace the background",
    "change the background",
];

/// Keyword planner used when the language model is unavailable or its reply
/// cannot be parsed. Always returns a well-formed plan.
pub fn fallback_plan(instruction: &str, catalog: &[String]) -> Plan {
    let lowered = instruction.to_lowercase();
    let explicit_remove = REMOVE_KEYWORDS.iter().any(|kw| lowered.contains(kw));
    let wants_replacement = REPLACE_KEYWORDS.iter().any(|kw| lowered.contains(kw));

    let mut edit = None;
    let mut warnings = Vec::new();
    if let Some(entry) = find_catalog_mention(lowered.as_str(), catalog) {
        edit = Some(Action::replace_background(entry, 0.8));
    } else if let Some(color) = find_color_mention(lowered.as_str()) {
        edit = Some(Action::set_background_color(color, 0.7));
    } else if wants_replacement {
        warnings.push(String::from(
            "Background replacement requested but no matching background image or color was named",
        ));
    }

    let mut actions = Vec::new();
    if explicit_remove {
        actions.push(Action::remove_background(0.9));
    } else if edit.is_some() {
        actions.push(Action::remove_background(0.7));
    }
    actions.extend(edit);
    if actions.is_empty() && lowered.contains("background") {
        actions.push(Action::remove_background(0.6));
    }

    Plan {
        actions,
        reasoning: String::from(FALLBACK_REASONING),
        warnings,
    }
}

// Stems that are also ordinary instruction words; such entries only match by
// full filename.
const GENERIC_STEMS: &[&str] = &["background", "backgrounds"];

fn find_catalog_mention(lowered: &str, catalog: &[String]) -> Option<String> {
    let mut candidates = catalog
        .iter()
        .map(|entry| (stem_key(entry.as_str()), entry))
        .filter(|(stem, _)| !stem.is_empty())
        .collect::<Vec<_>>();
    // Longest stems first so "bg10" wins over "bg1".
    candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    candidates
        .into_iter()
        .find(|(stem, entry)| {
            let by_stem =
                !GENERIC_STEMS.contains(&stem.as_str()) && contains_word(lowered, stem.as_str());
            by_stem || lowered.contains(entry.to_lowercase().as_str())
        })
        .map(|(_, entry)| entry.clone())
}

fn find_color_mention(lowered: &str) -> Option<String> {
    if let Some(hex) = hex_color_regex().find(lowered) {
        return Some(hex.as_str().to_string());
    }
    let mut names = named_colors().collect::<Vec<_>>();
    names.sort_by(|a, b| b.len().cmp(&a.len()));
    names
        .into_iter()
        .find(|name| contains_word(lowered, name))
        .map(str::to_string)
}

/// `word` occurs in `haystack` with no letter, digit or `_` on either side.
fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let is_word_char = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn hex_color_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#[0-9a-f]{6}\b").expect("hex color regex is valid"))
}
