//! Single-request AI classification of one entry against a list of tags.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::ai::{ChatCompletion, ChatMessage, ChatOptions};
use crate::error::Result;
use crate::models::UserTag;
use crate::services::content_extractor::{clean_html_text, truncate_chars};

const MAX_TITLE_CHARS: usize = 100;
const MAX_SUMMARY_CHARS: usize = 150;
const MAX_CONTENT_CHARS: usize = 250;
const MAX_TOTAL_CHARS: usize = 500;

const CLASSIFY_OPTIONS: ChatOptions = ChatOptions {
    max_tokens: 300,
    temperature: 0.2,
};

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```(?:json)?\s*").unwrap());

/// What the classifier sees of an entry.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub title: &'a str,
    pub summary: Option<&'a str>,
    pub content: Option<&'a str>,
}

fn clip(text: &str, max: usize) -> String {
    let clipped = truncate_chars(text, max);
    if clipped.len() < text.len() {
        format!("{clipped}...")
    } else {
        clipped.to_string()
    }
}

/// Title, summary and a content preview, each clipped, with the whole capped.
pub fn build_article_content(input: &ClassifyInput<'_>) -> String {
    let mut parts = vec![format!("Title: {}", clip(input.title, MAX_TITLE_CHARS))];

    if let Some(summary) = input.summary.filter(|s| !s.trim().is_empty()) {
        parts.push(format!("Summary: {}", clip(summary.trim(), MAX_SUMMARY_CHARS)));
    }

    if let Some(body) = input.content.and_then(clean_html_text) {
        parts.push(format!("Content preview: {}", clip(&body, MAX_CONTENT_CHARS)));
    }

    clip(&parts.join("\n\n"), MAX_TOTAL_CHARS)
}

fn system_prompt(tags: &[&UserTag]) -> String {
    let tag_list = tags
        .iter()
        .map(|tag| match tag.description.as_deref().filter(|d| !d.is_empty()) {
            Some(desc) => format!("- id={} | name={} | description={}", tag.id, tag.name, desc),
            None => format!("- id={} | name={}", tag.id, tag.name),
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You classify articles into user-defined tags.\n\n\
         Available tags:\n{tag_list}\n\n\
         Rules:\n\
         1. Return only ids of tags that fit the article.\n\
         2. An article may match several tags or none.\n\
         3. Choose only from the list above; never invent tags.\n\
         4. Answer with a JSON array of tag ids and nothing else.\n\n\
         Example: [3, 7]\n\
         No match: []"
    )
}

/// Reads the tag ids out of a model answer. Anything that is not one of
/// `allowed` is discarded, duplicates collapse, order is kept.
pub fn parse_tag_ids(response: &str, allowed: &HashSet<i64>) -> Vec<i64> {
    let cleaned = CODE_FENCE.replace_all(response, "");
    let cleaned = cleaned.trim();
    let candidates: Vec<serde_json::Value> = match serde_json::from_str(cleaned) {
        Ok(values) => values,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|value| match value {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|id| allowed.contains(id) && seen.insert(*id))
        .collect()
}

/// Asks the model which of `tags` apply. An empty tag list never calls out.
pub async fn classify(
    client: &dyn ChatCompletion,
    input: &ClassifyInput<'_>,
    tags: &[&UserTag],
) -> Result<Vec<i64>> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }

    let messages = vec![
        ChatMessage::system(system_prompt(tags)),
        ChatMessage::user(format!(
            "Classify this article and return the matching tag ids as a JSON array:\n\n{}",
            build_article_content(input)
        )),
    ];
    let answer = client.chat(messages, CLASSIFY_OPTIONS).await?;

    let allowed: HashSet<i64> = tags.iter().map(|t| t.id).collect();
    Ok(parse_tag_ids(&answer, &allowed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_answers_are_read() {
        let allowed: HashSet<i64> = [1, 2, 3].into_iter().collect();
        assert_eq!(parse_tag_ids("```json\n[2, \"3\"]\n```", &allowed), vec![2, 3]);
        assert_eq!(parse_tag_ids("[1]", &allowed), vec![1]);
    }

    #[test]
    fn hallucinated_and_duplicate_ids_are_dropped() {
        let allowed: HashSet<i64> = [1, 2].into_iter().collect();
        assert_eq!(parse_tag_ids("[2, 99, 2, \"x\", null, 1]", &allowed), vec![2, 1]);
        assert!(parse_tag_ids("I think tag 1 fits", &allowed).is_empty());
        assert!(parse_tag_ids("{\"ids\": [1]}", &allowed).is_empty());
    }

    #[test]
    fn article_content_is_capped() {
        let title = "t".repeat(300);
        let summary = "s".repeat(300);
        let content = format!("<p>{}</p>", "c".repeat(1000));
        let built = build_article_content(&ClassifyInput {
            title: &title,
            summary: Some(&summary),
            content: Some(&content),
        });

        assert!(built.starts_with(&format!("Title: {}...", "t".repeat(MAX_TITLE_CHARS))));
        assert!(built.contains(&format!("Summary: {}...", "s".repeat(MAX_SUMMARY_CHARS))));
        assert!(!built.contains("<p>"));
        assert_eq!(built.chars().count(), MAX_TOTAL_CHARS + 3);
    }

    #[test]
    fn short_articles_are_not_clipped() {
        let built = build_article_content(&ClassifyInput {
            title: "Hello",
            summary: None,
            content: Some("<b>world</b>"),
        });
        assert_eq!(built, "Title: Hello\n\nContent preview: world");
    }
}
