use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Global switch for the fetch phase of each scheduler tick.
    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    /// Lower bound on how often a feed is re-fetched.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_minutes: u32,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub tagging: AiServiceConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Mirror base the user prefers for RSSHub-style routes.
    #[serde(default = "default_rsshub_url")]
    pub rsshub_url: Option<String>,

    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Known-problematic feed URL -> alternatives in priority order.
    #[serde(default = "default_alternatives")]
    pub alternatives: BTreeMap<String, Vec<String>>,

    /// Domain -> User-Agent override.
    #[serde(default = "default_user_agents")]
    pub user_agents: BTreeMap<String, String>,
}

/// Credentials for an OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiServiceConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_min_content_len")]
    pub min_content_len: usize,

    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl AiServiceConfig {
    /// Returns `(base_url, api_key, model)` when all three are set and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        complete_credentials(&self.base_url, &self.api_key, &self.model)
    }
}

impl EmbeddingConfig {
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        complete_credentials(&self.base_url, &self.api_key, &self.model)
    }
}

fn complete_credentials<'a>(
    base_url: &'a Option<String>,
    api_key: &'a Option<String>,
    model: &'a Option<String>,
) -> Option<(&'a str, &'a str, &'a str)> {
    let pick = |value: &'a Option<String>| value.as_deref().map(str::trim).filter(|v| !v.is_empty());
    Some((pick(base_url)?, pick(api_key)?, pick(model)?))
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feed-enricher");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("feeds.db").to_string_lossy().to_string()
}

fn default_true() -> bool {
    true
}

fn default_fetch_interval() -> u32 {
    720
}

fn default_tick_interval() -> u64 {
    300
}

fn default_rsshub_url() -> Option<String> {
    Some("https://rsshub.app".to_string())
}

fn default_mirrors() -> Vec<String> {
    [
        "https://rsshub.app",
        "https://rsshub.rssforever.com",
        "https://rsshub.ktachibana.party",
        "https://rsshub.cskaoyan.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_alternatives() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 4] = [
        (
            "https://rsshub.app/nature/research/ng",
            &[
                "https://www.nature.com/ng/current.rss",
                "https://feeds.nature.com/ng/current",
            ],
        ),
        (
            "https://rsshub.app/nature/research/nmeth",
            &[
                "https://www.nature.com/nmeth/current.rss",
                "https://feeds.nature.com/nmeth/current",
            ],
        ),
        (
            "https://rsshub.app/nature/research/nat",
            &["https://www.nature.com/nature/current.rss"],
        ),
        (
            "https://rsshub.app/nature/research/ncomms",
            &["https://www.nature.com/ncomms/rss/current"],
        ),
    ];
    table
        .into_iter()
        .map(|(url, alts)| (url.to_string(), alts.iter().map(|a| a.to_string()).collect()))
        .collect()
}

fn default_user_agents() -> BTreeMap<String, String> {
    [
        ("academic.oup.com", "Mozilla/5.0 (compatible; RSS Reader/1.0; Academic)"),
        ("nature.com", "Mozilla/5.0 (compatible; RSS Reader/1.0; Nature)"),
        ("science.org", "Mozilla/5.0 (compatible; RSS Reader/1.0; Science)"),
    ]
    .into_iter()
    .map(|(domain, ua)| (domain.to_string(), ua.to_string()))
    .collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_read_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_redirects() -> usize {
    3
}

fn default_batch_size() -> usize {
    20
}

fn default_min_content_len() -> usize {
    50
}

fn default_ai_timeout() -> u64 {
    90
}

fn default_embedding_timeout() -> u64 {
    60
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            rsshub_url: default_rsshub_url(),
            mirrors: default_mirrors(),
            alternatives: default_alternatives(),
            user_agents: default_user_agents(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_redirects: default_max_redirects(),
        }
    }
}

impl Default for AiServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            batch_size: default_batch_size(),
            timeout_secs: default_ai_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            batch_size: default_batch_size(),
            min_content_len: default_min_content_len(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            auto_refresh: true,
            fetch_interval_minutes: default_fetch_interval(),
            tick_interval_secs: default_tick_interval(),
            fetch: FetchConfig::default(),
            tagging: AiServiceConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Reads the config at `path`, writing defaults there first if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feed-enricher")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch_interval_minutes, 720);
        assert!(config.tagging.credentials().is_none());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/tmp/x.db"
auto_refresh = false

[tagging]
api_key = "sk-test"
base_url = "https://api.example.com/v1"
model = "small"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert!(!config.auto_refresh);
        assert_eq!(config.fetch.retry_delay_ms, 1000);
        assert_eq!(config.tagging.batch_size, 20);
        assert_eq!(
            config.tagging.credentials(),
            Some(("https://api.example.com/v1", "sk-test", "small"))
        );
        assert!(config.fetch.mirrors.contains(&"https://rsshub.app".to_string()));
    }

    #[test]
    fn blank_credentials_are_incomplete() {
        let cfg = EmbeddingConfig {
            api_key: Some("  ".into()),
            base_url: Some("https://x".into()),
            model: Some("m".into()),
            ..Default::default()
        };
        assert!(cfg.credentials().is_none());
    }
}
