pub mod content_extractor;

pub use content_extractor::{clean_html_text, extract_readable, readable_text};
