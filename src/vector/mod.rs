mod sync;

pub use sync::{build_embedding_input, SyncReport, VectorSync, DEFAULT_SEARCH_LIMIT};
