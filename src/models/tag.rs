use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Ai,
    Rule,
    Both,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Ai => "ai",
            MatchMode::Rule => "rule",
            MatchMode::Both => "both",
        }
    }

    /// Unknown values fall back to `Ai`, the mode tags had before rules existed.
    pub fn parse(s: &str) -> Self {
        match s {
            "rule" => MatchMode::Rule,
            "both" => MatchMode::Both,
            _ => MatchMode::Ai,
        }
    }

    pub fn uses_rules(&self) -> bool {
        matches!(self, MatchMode::Rule | MatchMode::Both)
    }

    pub fn uses_ai(&self) -> bool {
        matches!(self, MatchMode::Ai | MatchMode::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// One keyword group of a tag's rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMatchRule {
    pub keywords: Vec<String>,
    pub operator: RuleOperator,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTag {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub match_mode: MatchMode,
    /// JSON array of [`TagMatchRule`] groups.
    pub match_rules: Option<String>,
    pub enabled: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTag {
    pub name: String,
    pub description: Option<String>,
    pub match_mode: MatchMode,
    pub match_rules: Vec<TagMatchRule>,
    pub enabled: bool,
}

impl NewTag {
    pub fn ai(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            match_mode: MatchMode::Ai,
            match_rules: Vec::new(),
            enabled: true,
        }
    }

    pub fn rule(name: impl Into<String>, rules: Vec<TagMatchRule>) -> Self {
        Self {
            name: name.into(),
            description: None,
            match_mode: MatchMode::Rule,
            match_rules: rules,
            enabled: true,
        }
    }
}

/// Partial update of a tag definition; `None` fields are left untouched.
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default)]
pub struct TagUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub match_mode: Option<MatchMode>,
    pub match_rules: Option<Option<Vec<TagMatchRule>>>,
    pub enabled: Option<bool>,
}

impl TagUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.match_mode.is_none()
            && self.match_rules.is_none()
            && self.enabled.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryTag {
    pub entry_id: i64,
    pub tag_id: i64,
    pub is_manual: bool,
    pub created_at: DateTime<Utc>,
}
