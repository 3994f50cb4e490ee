//! Feed acquisition and enrichment: mirrored RSS/Atom fetching, keyword and
//! AI tagging, and embedding-based semantic search over the stored entries.

pub mod ai;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod tagging;
pub mod vector;

pub use app::App;
pub use config::Config;
pub use error::{AppError, Result};
