mod analysis;
mod entry;
mod feed;
mod fetch_log;
mod tag;
mod vector;

pub use analysis::{AnalysisStats, AnalysisStatus, EntryAnalysisStatus, EntryQuery, Page, Upserted};
pub use entry::{Enclosure, Entry, NewEntry};
pub use feed::{Feed, FeedMetadata, NewFeed};
pub use fetch_log::{FetchLog, FetchLogStatus, FetchOutcome};
pub use tag::{EntryTag, MatchMode, NewTag, RuleOperator, TagMatchRule, TagUpdate, UserTag};
pub use vector::{NewVectorRecord, VectorHit};
