mod repository;
mod schema;
mod tagging;
mod vectors;

pub use repository::Repository;
pub use tagging::PipelineSettings;
