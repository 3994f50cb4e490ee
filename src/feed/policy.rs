//! URL resolution, user-agent selection and retry rules for feed downloads.
//! Everything here is pure and driven by [`FetchConfig`].

use std::time::Duration;

use url::Url;

use crate::config::FetchConfig;
use crate::error::FetchError;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; RSS Reader/1.0; +https://github.com/rss-reader)";

const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Hosts containing "rsshub" serve aggregator routes that any mirror can answer.
pub fn is_rsshub_like(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase().contains("rsshub")))
        .unwrap_or(false)
}

fn mirror_candidate(base: &str, original: &Url) -> String {
    let mut candidate = format!("{}{}", base.trim_end_matches('/'), original.path());
    if let Some(query) = original.query() {
        candidate.push('?');
        candidate.push_str(query);
    }
    candidate
}

/// Ordered, de-duplicated list of URLs to try for `original`: the URL itself,
/// then the preferred mirror and the mirror list for RSSHub-style routes,
/// then any static alternatives. The first URL that yields a feed wins.
pub fn candidate_urls(original: &str, config: &FetchConfig) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    let mut add = |url: String| {
        if !url.is_empty() && !urls.contains(&url) {
            urls.push(url);
        }
    };

    add(original.to_string());

    if is_rsshub_like(original) {
        if let Ok(parsed) = Url::parse(original) {
            if let Some(base) = config.rsshub_url.as_deref().map(str::trim) {
                let already_on_base =
                    original.starts_with(&format!("{}/", base.trim_end_matches('/')));
                if !base.is_empty() && !already_on_base {
                    add(mirror_candidate(base, &parsed));
                }
            }
            for base in &config.mirrors {
                add(mirror_candidate(base, &parsed));
            }
        }
    }

    if let Some(alternatives) = config.alternatives.get(original) {
        for alt in alternatives {
            add(alt.clone());
        }
    }

    urls
}

/// Per-domain override when the host contains a configured domain, else the default.
pub fn user_agent_for<'a>(url: &str, config: &'a FetchConfig) -> &'a str {
    let host = match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        Some(host) => host,
        None => return DEFAULT_USER_AGENT,
    };
    config
        .user_agents
        .iter()
        .find(|(domain, _)| host.contains(domain.as_str()))
        .map(|(_, ua)| ua.as_str())
        .unwrap_or(DEFAULT_USER_AGENT)
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

impl FetchError {
    /// Timeouts, network failures and throttling/gateway statuses are worth
    /// another attempt on the same URL. Parse failures and other statuses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status(code) => is_retryable_status(*code),
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Parse(_) => false,
        }
    }
}

/// `max_retries` extra attempts per URL, a constant delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether a failure on the zero-based `attempt` should be retried.
    pub fn should_retry(&self, attempt: u32, error: &FetchError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    pub fn delay_for(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FetchConfig {
        FetchConfig {
            rsshub_url: Some("https://my.rsshub.example/".into()),
            mirrors: vec![
                "https://rsshub.app".into(),
                "https://rsshub.rssforever.com".into(),
            ],
            ..FetchConfig::default()
        }
    }

    #[test]
    fn rsshub_routes_expand_to_mirrors_in_order() {
        let urls = candidate_urls("https://rsshub.app/github/issue/a/b?limit=5", &config());
        assert_eq!(
            urls,
            vec![
                "https://rsshub.app/github/issue/a/b?limit=5",
                "https://my.rsshub.example/github/issue/a/b?limit=5",
                "https://rsshub.rssforever.com/github/issue/a/b?limit=5",
            ]
        );
    }

    #[test]
    fn preferred_base_is_skipped_when_already_used() {
        let urls = candidate_urls("https://my.rsshub.example/x", &config());
        assert_eq!(urls[0], "https://my.rsshub.example/x");
        assert_eq!(urls.iter().filter(|u| u.starts_with("https://my.")).count(), 1);
    }

    #[test]
    fn plain_feeds_only_get_static_alternatives() {
        let cfg = FetchConfig::default();
        assert_eq!(
            candidate_urls("https://blog.example.com/feed", &cfg),
            vec!["https://blog.example.com/feed"]
        );

        let urls = candidate_urls("https://rsshub.app/nature/research/ng", &cfg);
        assert_eq!(urls[0], "https://rsshub.app/nature/research/ng");
        assert!(urls.ends_with(&[
            "https://www.nature.com/ng/current.rss".to_string(),
            "https://feeds.nature.com/ng/current".to_string(),
        ]));
    }

    #[test]
    fn user_agent_matches_by_host_substring() {
        let cfg = FetchConfig::default();
        assert_eq!(
            user_agent_for("https://www.nature.com/ng/current.rss", &cfg),
            "Mozilla/5.0 (compatible; RSS Reader/1.0; Nature)"
        );
        assert_eq!(user_agent_for("https://example.com/rss", &cfg), DEFAULT_USER_AGENT);
        assert_eq!(user_agent_for("not a url", &cfg), DEFAULT_USER_AGENT);
    }

    #[test]
    fn retry_classification() {
        for code in [429, 502, 503, 504] {
            assert!(FetchError::Status(code).is_retryable(), "{code}");
        }
        for code in [400, 401, 403, 404, 500] {
            assert!(!FetchError::Status(code).is_retryable(), "{code}");
        }
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(!FetchError::Parse("bad xml".into()).is_retryable());
    }

    #[test]
    fn retry_policy_caps_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::ZERO,
        };
        let err = FetchError::Status(503);
        assert!(policy.should_retry(0, &err));
        assert!(policy.should_retry(1, &err));
        assert!(!policy.should_retry(2, &err));
        assert_eq!(policy.max_attempts(), 3);
    }
}
