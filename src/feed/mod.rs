pub mod extract;
pub mod fetcher;
pub mod fields;
pub mod http;
pub mod policy;

pub use fetcher::FeedFetcher;
pub use http::{HttpFetch, ReqwestFetcher};
pub use policy::{candidate_urls, is_retryable_status, user_agent_for, RetryPolicy};
