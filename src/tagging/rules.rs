//! Keyword rule matching. Pure and synchronous; costs nothing to run on
//! every entry.

use tracing::debug;

use crate::models::{RuleOperator, TagMatchRule, UserTag};

/// Parses a tag's stored rule JSON. Groups that do not deserialize, or that
/// carry no keywords, are dropped individually; malformed JSON yields none.
pub fn parse_match_rules(rules_json: Option<&str>) -> Vec<TagMatchRule> {
    let Some(json) = rules_json else {
        return Vec::new();
    };
    let groups: Vec<serde_json::Value> = match serde_json::from_str(json) {
        Ok(groups) => groups,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable match rules");
            return Vec::new();
        }
    };
    groups
        .into_iter()
        .filter_map(|group| serde_json::from_value::<TagMatchRule>(group).ok())
        .filter(|rule| rule.keywords.iter().any(|k| !k.is_empty()))
        .collect()
}

fn group_matches(haystack: &str, rule: &TagMatchRule) -> bool {
    let contains = |needle: &String| !needle.is_empty() && haystack.contains(&needle.to_lowercase());

    if rule.exclude.iter().any(contains) {
        return false;
    }
    match rule.operator {
        RuleOperator::And => rule.keywords.iter().all(contains),
        RuleOperator::Or => rule.keywords.iter().any(contains),
    }
}

/// Whether any of the tag's rule groups matches `title + " " + summary`.
pub fn match_entry_by_rules(title: &str, summary: Option<&str>, tag: &UserTag) -> bool {
    let rules = parse_match_rules(tag.match_rules.as_deref());
    if rules.is_empty() {
        return false;
    }

    let text = match summary.filter(|s| !s.is_empty()) {
        Some(summary) if !title.is_empty() => format!("{title} {summary}"),
        Some(summary) => summary.to_string(),
        None => title.to_string(),
    };
    if text.trim().is_empty() {
        return false;
    }

    let haystack = text.to_lowercase();
    rules.iter().any(|rule| group_matches(&haystack, rule))
}

/// Ids of the rule-capable tags in `tags` that match the entry text.
pub fn rule_matches(title: &str, summary: Option<&str>, tags: &[UserTag]) -> Vec<i64> {
    tags.iter()
        .filter(|tag| tag.match_mode.uses_rules())
        .filter(|tag| match_entry_by_rules(title, summary, tag))
        .map(|tag| tag.id)
        .collect()
}
