//! Field extraction for feed items: dedup key, publication date, enclosure,
//! duration, image, DOI/PMID and the feed icon. Each value comes from an
//! ordered chain of field checks; nothing is fabricated when all checks miss.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use url::Url;

use super::fields::ItemFields;
use crate::models::Enclosure;

/// An item as seen by the extractors: structural fields normalized by
/// `feed-rs`, plus the raw namespaced fields from the same item.
#[derive(Debug, Clone, Default)]
pub struct ParsedItem {
    pub fields: ItemFields,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content_html: Option<String>,
    pub summary_html: Option<String>,
    pub categories: Vec<String>,
    /// Publication date as already parsed by `feed-rs`.
    pub published: Option<DateTime<Utc>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ParsedItem {
    /// Items built from raw fields alone, when `feed-rs` output is unavailable.
    pub fn from_fields(fields: ItemFields) -> Self {
        let link = fields
            .text("link")
            .or_else(|| fields.attr("link", "href"))
            .map(str::to_string);
        Self {
            title: fields.text("title").map(str::to_string),
            link,
            author: fields
                .text("dc:creator")
                .or_else(|| fields.text("author"))
                .map(str::to_string),
            content_html: fields
                .text("content:encoded")
                .or_else(|| fields.text("content"))
                .map(str::to_string),
            summary_html: fields
                .text("description")
                .or_else(|| fields.text("summary"))
                .map(str::to_string),
            categories: fields
                .all("category")
                .iter()
                .map(|c| c.text.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            published: None,
            fields,
        }
    }

    /// Combines a `feed-rs` entry with the raw fields scanned from the same
    /// item. Structural values prefer `feed-rs`; raw fields fill the gaps.
    pub fn from_entry(entry: feed_rs::model::Entry, fields: ItemFields) -> Self {
        let raw = Self::from_fields(fields);

        let link = entry
            .links
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or_else(|| entry.links.first())
            .map(|l| l.href.clone());
        let categories: Vec<String> = entry
            .categories
            .iter()
            .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
            .filter(|c| !c.trim().is_empty())
            .collect();

        Self {
            title: non_empty(entry.title.map(|t| t.content)).or(raw.title),
            link: non_empty(link).or(raw.link),
            author: non_empty(entry.authors.first().map(|a| a.name.clone())).or(raw.author),
            content_html: non_empty(entry.content.and_then(|c| c.body)).or(raw.content_html),
            summary_html: non_empty(entry.summary.map(|s| s.content)).or(raw.summary_html),
            categories: if categories.is_empty() {
                raw.categories
            } else {
                categories
            },
            published: entry.published,
            fields: raw.fields,
        }
    }

    /// Body stored as the entry's raw content.
    pub fn body_html(&self) -> Option<&str> {
        self.content_html.as_deref().or(self.summary_html.as_deref())
    }

    /// Source for the plain-text summary: summary first, then content.
    pub fn summary_source(&self) -> Option<&str> {
        self.summary_html.as_deref().or(self.content_html.as_deref())
    }
}

/// `guid` → `link` → `title`; `None` means the item cannot be deduplicated and is skipped.
///
/// The guid only ever comes from the item's own markup. `feed-rs` invents an
/// id for items that have none, and keying on it would change an item's
/// identity whenever the raw fields are unavailable.
pub fn dedup_key(item: &ParsedItem) -> Option<String> {
    let guid = item
        .fields
        .text("guid")
        .or_else(|| item.fields.text("id"))
        .map(str::to_string);
    non_empty(guid)
        .or_else(|| non_empty(item.link.clone()))
        .or_else(|| non_empty(item.title.clone()))
}

// Dates

const PRIMARY_DATE_FIELDS: [&str; 2] = ["pubDate", "published"];
const ALTERNATE_DATE_FIELDS: [&str; 4] = ["pubdate", "updated", "date", "dc:date"];

static DESCRIPTION_DATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)Publication date:\s*([A-Za-z]+)\s+(\d{4})",
        r"(?i)Published:\s*([A-Za-z]+)\s+(\d{4})",
        r"(?i)Date:\s*([A-Za-z]+)\s+(\d{4})",
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Parses one date string in any of the formats feeds are seen to use.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let n: i64 = s.parse().ok()?;
        return if n > 1_000_000_000_000 {
            Utc.timestamp_millis_opt(n).single()
        } else if n > 0 {
            Utc.timestamp_opt(n, 0).single()
        } else {
            None
        };
    }
    None
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// "Publication date: March 2026" and similar, resolved to the 1st of the month (UTC).
pub fn date_from_description(text: &str) -> Option<DateTime<Utc>> {
    DESCRIPTION_DATES.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let month = month_number(caps.get(1)?.as_str())?;
        let year: i32 = caps.get(2)?.as_str().parse().ok()?;
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
    })
}

/// Primary date fields, then the `feed-rs` date, then alternate fields, then
/// a month/year phrase in the description. `None` when nothing matches.
pub fn resolve_published(item: &ParsedItem) -> Option<DateTime<Utc>> {
    let from_fields = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| item.fields.text(key))
            .find_map(parse_date)
    };

    from_fields(&PRIMARY_DATE_FIELDS[..])
        .or(item.published)
        .or_else(|| from_fields(&ALTERNATE_DATE_FIELDS[..]))
        .or_else(|| {
            [
                item.fields.text("description"),
                item.fields.text("content:encoded"),
                item.summary_html.as_deref(),
                item.content_html.as_deref(),
            ]
            .into_iter()
            .flatten()
            .find_map(date_from_description)
        })
}

// Media

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Standard `<enclosure>` first, then `media:content`.
pub fn extract_enclosure(item: &ParsedItem) -> Option<Enclosure> {
    let fields = &item.fields;
    if let Some(enc) = fields.all("enclosure").iter().find(|e| e.attr("url").is_some_and(is_http)) {
        return Some(Enclosure {
            url: enc.attr("url")?.to_string(),
            mime_type: enc.attr("type").map(str::to_string),
            length: enc.attr("length").and_then(|l| l.parse().ok()),
        });
    }
    let media = fields.all("media:content").iter().find(|m| m.attr("url").is_some())?;
    Some(Enclosure {
        url: media.attr("url")?.to_string(),
        mime_type: media.attr("type").map(str::to_string),
        length: media.attr("fileSize").and_then(|l| l.parse().ok()),
    })
}

pub fn extract_duration(item: &ParsedItem) -> Option<String> {
    item.fields.text("itunes:duration").map(str::to_string)
}

/// Item `itunes:image`, then `media:thumbnail`, then the feed-level image.
pub fn extract_image(item: &ParsedItem, feed_image: Option<&str>) -> Option<String> {
    let fields = &item.fields;
    fields
        .attr("itunes:image", "href")
        .or_else(|| fields.text("itunes:image"))
        .or_else(|| fields.attr("media:thumbnail", "url"))
        .or(feed_image)
        .map(str::to_string)
}

// Identifiers

static DOI_PREFIXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^doi:\s*(.+)$").unwrap());

static BARE_DOI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^10\.\d{4,}/\S+").unwrap());

static DOI_ORG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)doi\.org/(10\.\d{4,}/[^\s?#]+)").unwrap());

static NATURE_ARTICLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nature\.com/articles/(s\d+-\d+-\d+-\w)").unwrap());

static ELIFE_ARTICLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"elifesciences\.org/articles/(\d+)").unwrap());

static DOI_IN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(10\.\d{4,}/[^?#\s]+)").unwrap());

static PREPRINT_VERSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"v\d+$").unwrap());

static PMID_PREFIXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^pmid:\s*(\d+)$").unwrap());

static PUBMED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)pubmed\.ncbi\.nlm\.nih\.gov/(\d+)").unwrap());

/// Hosts that put the DOI itself in the article path.
const DOI_PATH_HOSTS: [&str; 7] = [
    "link.springer.com",
    "onlinelibrary.wiley.com",
    "science.org",
    "pnas.org",
    "biorxiv.org",
    "medrxiv.org",
    "journals.plos.org",
];

fn clean_doi(doi: &str) -> String {
    let mut doi = doi.trim().trim_end_matches('/');
    for suffix in [".full", ".abstract", ".pdf", "/full", "/abstract", "/pdf"] {
        if let Some(stripped) = doi.strip_suffix(suffix) {
            doi = stripped;
        }
    }
    doi.to_string()
}

/// DOI from a publisher URL, using the table of known URL shapes.
pub fn doi_from_url(link: &str) -> Option<String> {
    if let Some(caps) = DOI_ORG.captures(link) {
        return Some(clean_doi(&caps[1]));
    }
    if let Some(caps) = NATURE_ARTICLE.captures(link) {
        return Some(format!("10.1038/{}", &caps[1]));
    }
    if let Some(caps) = ELIFE_ARTICLE.captures(link) {
        return Some(format!("10.7554/eLife.{}", &caps[1]));
    }

    let url = Url::parse(link).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    if !DOI_PATH_HOSTS.iter().any(|h| host.ends_with(h)) {
        return None;
    }
    if let Some((_, id)) = url.query_pairs().find(|(k, v)| k == "id" && BARE_DOI.is_match(v)) {
        return Some(clean_doi(&id));
    }
    let caps = DOI_IN_PATH.captures(url.path())?;
    let doi = clean_doi(&caps[1]);
    if host.ends_with("biorxiv.org") || host.ends_with("medrxiv.org") {
        return Some(PREPRINT_VERSION.replace(&doi, "").into_owned());
    }
    Some(doi)
}

/// `dc:identifier` → `prism:doi` → URL patterns.
pub fn extract_doi(item: &ParsedItem) -> Option<String> {
    if let Some(identifier) = item.fields.text("dc:identifier") {
        if let Some(caps) = DOI_PREFIXED.captures(identifier) {
            return Some(caps[1].trim().to_string());
        }
        if BARE_DOI.is_match(identifier) {
            return Some(identifier.to_string());
        }
    }
    if let Some(doi) = item.fields.text("prism:doi").filter(|d| BARE_DOI.is_match(d)) {
        return Some(doi.to_string());
    }
    item.link.as_deref().and_then(doi_from_url)
}

/// `dc:identifier` with a `pmid:` prefix → `pmid` field → PubMed URL.
pub fn extract_pmid(item: &ParsedItem) -> Option<String> {
    if let Some(caps) = item.fields.text("dc:identifier").and_then(|i| PMID_PREFIXED.captures(i)) {
        return Some(caps[1].to_string());
    }
    if let Some(pmid) = item.fields.text("pmid") {
        return Some(pmid.to_string());
    }
    let caps = PUBMED_URL.captures(item.link.as_deref()?)?;
    Some(caps[1].to_string())
}

// Feed icon

/// Absolute http(s) URL for an icon reference, or `None` for `data:` URIs
/// and references that cannot be resolved.
pub fn normalize_icon_url(candidate: &str, base_url: Option<&str>) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.starts_with("data:") {
        return None;
    }
    if let Some(rest) = candidate.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if let Ok(url) = Url::parse(candidate) {
        return matches!(url.scheme(), "http" | "https").then(|| candidate.to_string());
    }
    let base = Url::parse(base_url?).ok()?;
    base.join(candidate).ok().map(|u| u.to_string())
}

fn origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// First usable icon among `candidates` (already in priority order), falling
/// back to the conventional icon paths under the site origin.
pub fn select_feed_icon<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    site_url: Option<&str>,
    feed_url: &str,
) -> Option<String> {
    let base = site_url.unwrap_or(feed_url);
    candidates
        .into_iter()
        .find_map(|c| normalize_icon_url(c, Some(base)))
        .or_else(|| {
            let origin = origin(base)?;
            Some(format!("{origin}/favicon.ico"))
        })
}
