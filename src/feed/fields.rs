//! Loosely typed view of feed items.
//!
//! `feed-rs` normalizes the structural parts of RSS and Atom but drops most
//! vendor extensions (`itunes:*`, `prism:*`, `dc:identifier`, raw date
//! strings). This module walks the raw document with `quick-xml` and records
//! every element of each `<item>`/`<entry>` by its namespaced name so
//! extraction can look fields up by key.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use regex::Regex;

static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9A-Fa-f]+|[0-9]+);").unwrap());

/// Text and attributes of one element occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValue {
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

impl FieldValue {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Every element of an item, keyed by its qualified name (`pubDate`,
/// `dc:date`, `itunes:image`, ...). Repeated elements keep document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFields {
    fields: BTreeMap<String, Vec<FieldValue>>,
}

impl ItemFields {
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.entry(key.into()).or_default().push(value);
    }

    pub fn with(mut self, key: &str, value: FieldValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key).and_then(|values| values.first())
    }

    pub fn all(&self, key: &str) -> &[FieldValue] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Trimmed, non-empty text of the first `key` element.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .map(|v| v.text.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn attr(&self, key: &str, name: &str) -> Option<&str> {
        self.all(key).iter().find_map(|v| v.attr(name))
    }
}

/// Raw fields of a whole document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDocument {
    /// Elements before the first item or entry.
    pub channel: ItemFields,
    /// One entry per `<item>` (RSS) or `<entry>` (Atom), in document order.
    pub items: Vec<ItemFields>,
}

/// An element whose end tag has not been seen yet.
struct OpenElement {
    name: String,
    attrs: BTreeMap<String, String>,
    text: String,
}

/// Walks `xml` once. CDATA and escaped markup are element text, never
/// structure, so item counts follow the real document tree. A malformed tail
/// ends the scan and keeps everything completed before it.
pub fn scan_document(xml: &str) -> RawDocument {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    let mut doc = RawDocument::default();
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut current: Option<(usize, ItemFields)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let element = open_element(&e);
                if current.is_none() && is_item(&element.name) {
                    current = Some((stack.len(), ItemFields::default()));
                }
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = open_element(&e);
                let value = FieldValue {
                    text: String::new(),
                    attrs: element.attrs,
                };
                record(&mut doc, &mut current, element.name, value);
            }
            Ok(Event::Text(t)) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&unescape_text(&t));
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(open) = stack.last_mut() {
                    open.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(_)) => {
                let Some(open) = stack.pop() else { continue };
                if current.as_ref().is_some_and(|(depth, _)| *depth == stack.len()) {
                    if let Some((_, item)) = current.take() {
                        doc.items.push(item);
                    }
                    continue;
                }
                let value = FieldValue {
                    text: open.text.trim().to_string(),
                    attrs: open.attrs,
                };
                record(&mut doc, &mut current, open.name, value);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Raw field scan stopped at byte {}: {}", reader.buffer_position(), e);
                break;
            }
        }
    }

    doc
}

fn is_item(name: &str) -> bool {
    name == "item" || name == "entry"
}

fn record(doc: &mut RawDocument, current: &mut Option<(usize, ItemFields)>, name: String, value: FieldValue) {
    match current {
        Some((_, item)) => item.insert(name, value),
        None if doc.items.is_empty() => doc.channel.insert(name, value),
        None => {}
    }
}

fn open_element(start: &BytesStart<'_>) -> OpenElement {
    let mut attributes = start.attributes();
    attributes.with_checks(false);
    let attrs = attributes
        .flatten()
        .map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
            let value = a
                .unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| decode_entities(&String::from_utf8_lossy(&a.value)));
            (key, value)
        })
        .collect();
    OpenElement {
        name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
        attrs,
        text: String::new(),
    }
}

/// Unknown named entities (`&nbsp;` and friends) are left as written.
fn unescape_text(text: &BytesText<'_>) -> String {
    text.unescape()
        .map(|t| t.into_owned())
        .unwrap_or_else(|_| decode_entities(&String::from_utf8_lossy(text)))
}

/// Decodes the predefined XML entities and numeric character references.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let numeric = NUMERIC_ENTITY.replace_all(s, |caps: &regex::Captures| {
        let code = &caps[1];
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    numeric
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
