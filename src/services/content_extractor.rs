use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "style", "noscript", "nav", "header", "footer", "aside", "form"]
        .into_iter()
        .filter_map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).ok())
        .collect()
});

static URL_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(href|src)\s*=\s*"([^"]*)""#).unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const FALLBACK_CONTAINERS: &str = "article, main, [role=main], body";

/// Pulls the main article body out of an HTML document or fragment.
///
/// Each paragraph scores its non-link text length; the score goes to its
/// parent in full and to its grandparent at half weight, and the highest
/// scoring container wins. Relative `href` and `src` attributes in the result
/// are resolved against `base_url`. Returns `None` when nothing readable is found.
pub fn extract_readable(html: &str, base_url: &str) -> Option<String> {
    let stripped = BOILERPLATE
        .iter()
        .fold(html.to_string(), |acc, re| re.replace_all(&acc, "").into_owned());
    let document = Html::parse_document(&stripped);

    let paragraphs = Selector::parse("p").ok()?;
    let links = Selector::parse("a").ok()?;

    let mut scores: HashMap<_, (f64, ElementRef)> = HashMap::new();
    for paragraph in document.select(&paragraphs) {
        let link_text: usize = paragraph.select(&links).map(text_len).sum();
        let own = text_len(paragraph).saturating_sub(link_text);
        if own == 0 {
            continue;
        }
        let parent = paragraph.parent().and_then(ElementRef::wrap);
        let grandparent = parent.and_then(|p| p.parent()).and_then(ElementRef::wrap);
        for (container, weight) in [(parent, 1.0), (grandparent, 0.5)] {
            if let Some(container) = container {
                let entry = scores.entry(container.id()).or_insert((0.0, container));
                entry.0 += own as f64 * weight;
            }
        }
    }

    let best = scores
        .into_values()
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, element)| element)
        .or_else(|| {
            let containers = Selector::parse(FALLBACK_CONTAINERS).ok()?;
            document.select(&containers).find(|e| text_len(*e) > 0)
        })?;

    if text_len(best) == 0 {
        return None;
    }

    let base = Url::parse(base_url).ok();
    Some(resolve_relative_urls(best.inner_html().trim(), base.as_ref()))
}

fn text_len(element: ElementRef) -> usize {
    element.text().map(|t| t.trim().chars().count()).sum()
}

fn resolve_relative_urls(html: &str, base: Option<&Url>) -> String {
    let Some(base) = base else {
        return html.to_string();
    };
    URL_ATTRIBUTE
        .replace_all(html, |caps: &regex::Captures| {
            let value = &caps[2];
            let absolute = if value.starts_with('#')
                || value.starts_with("data:")
                || value.starts_with("mailto:")
                || Url::parse(value).is_ok()
            {
                value.to_string()
            } else {
                base.join(value)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| value.to_string())
            };
            format!(r#"{}="{}""#, &caps[1], absolute)
        })
        .into_owned()
}

/// Compact plain text of an HTML snippet: tags dropped, whitespace collapsed.
pub fn clean_html_text(html: &str) -> Option<String> {
    if html.trim().is_empty() {
        return None;
    }
    let fragment = Html::parse_fragment(html);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    let collapsed = WHITESPACE.replace_all(&text, " ").trim().to_string();
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Multi-line plain text rendering of an HTML body, one non-empty line per block.
pub fn readable_text(html: &str) -> Option<String> {
    let text = match html2text::from_read(html.as_bytes(), 120) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("Failed to convert HTML to text: {}", e);
            return None;
        }
    };

    let cleaned: String = text
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    (!cleaned.is_empty()).then_some(cleaned)
}

/// First `max_chars` characters of `s`, never splitting a character.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
