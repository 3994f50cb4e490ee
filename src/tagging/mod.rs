pub mod classifier;
pub mod engine;
pub mod rules;

pub use engine::{AnalysisResult, AnalysisSummary, AutoTaggingStats, TaggingEngine};
pub use rules::{match_entry_by_rules, parse_match_rules};
