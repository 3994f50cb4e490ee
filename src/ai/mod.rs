pub mod client;
pub mod embedding;

pub use client::{ChatClient, ChatCompletion, ChatMessage, ChatOptions};
pub use embedding::{Embedder, EmbeddingClient};
