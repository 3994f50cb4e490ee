use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::ai::{ChatClient, ChatCompletion, Embedder, EmbeddingClient};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::feed::{FeedFetcher, HttpFetch, ReqwestFetcher};
use crate::scheduler::{EnrichmentPipeline, Scheduler, TickSettings};
use crate::tagging::TaggingEngine;
use crate::vector::VectorSync;

/// Every service of the pipeline, built once at startup and shared from here.
pub struct App {
    pub repository: Repository,
    pub fetcher: Arc<FeedFetcher>,
    pub tagging: Arc<TaggingEngine>,
    pub vectors: Option<Arc<VectorSync>>,
    pub scheduler: Scheduler,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let repository = Repository::new(&config.db_path).await?;
        let http: Arc<dyn HttpFetch> = Arc::new(ReqwestFetcher::new(&config.fetch)?);

        let chat = ChatClient::from_config(&config.tagging)?;
        match &chat {
            Some(client) => info!(model = client.model(), "AI tagging configured"),
            None => info!("No AI credentials for tagging; only keyword rules will run"),
        }
        let embedder = EmbeddingClient::from_config(&config.embedding)?;
        if embedder.is_none() {
            info!("No embedding credentials; vector sync disabled");
        }

        Ok(Self::from_parts(
            config,
            repository,
            http,
            chat.map(|c| Arc::new(c) as Arc<dyn ChatCompletion>),
            embedder.map(|e| Arc::new(e) as Arc<dyn Embedder>),
        ))
    }

    /// Wires the services around already-built clients.
    pub fn from_parts(
        config: &Config,
        repository: Repository,
        http: Arc<dyn HttpFetch>,
        chat: Option<Arc<dyn ChatCompletion>>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        let fetcher = Arc::new(FeedFetcher::new(
            repository.clone(),
            http,
            config.fetch.clone(),
        ));
        let tagging = Arc::new(TaggingEngine::new(
            repository.clone(),
            chat,
            config.tagging.batch_size,
        ));
        let vectors = embedder.map(|embedder| {
            Arc::new(VectorSync::new(
                repository.clone(),
                embedder,
                config.embedding.min_content_len,
            ))
        });

        let pipeline = EnrichmentPipeline::new(
            repository.clone(),
            Arc::clone(&fetcher),
            vectors.clone(),
            Arc::clone(&tagging),
            TickSettings {
                auto_refresh: config.auto_refresh,
                fetch_interval_minutes: config.fetch_interval_minutes,
                vector_batch_size: config.embedding.batch_size,
                tagging_batch_size: config.tagging.batch_size,
            },
        );
        let scheduler = Scheduler::new(
            Arc::new(pipeline),
            Duration::from_secs(config.tick_interval_secs.max(1)),
        );

        Self {
            repository,
            fetcher,
            tagging,
            vectors,
            scheduler,
        }
    }

    pub fn vectors(&self) -> Result<&VectorSync> {
        self.vectors
            .as_deref()
            .ok_or_else(|| AppError::config("embedding service is not configured"))
    }
}
