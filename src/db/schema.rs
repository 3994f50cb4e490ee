pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- feeds table
CREATE TABLE IF NOT EXISTS feeds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    title TEXT,
    site_url TEXT,
    description TEXT,
    favicon_url TEXT,
    last_checked_at TEXT,
    last_error TEXT,
    update_interval_minutes INTEGER,
    ai_tagging_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feeds_url ON feeds(url);

-- entries table
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    guid TEXT NOT NULL,
    title TEXT,
    url TEXT,
    author TEXT,
    summary TEXT,
    content TEXT,
    readability_content TEXT,
    categories_json TEXT,
    published_at TEXT,
    inserted_at TEXT NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    starred INTEGER NOT NULL DEFAULT 0,
    enclosure_url TEXT,
    enclosure_type TEXT,
    enclosure_length INTEGER,
    duration TEXT,
    image_url TEXT,
    doi TEXT,
    pmid TEXT,
    UNIQUE(feed_id, guid)
);

CREATE INDEX IF NOT EXISTS idx_entries_feed_id ON entries(feed_id);
CREATE INDEX IF NOT EXISTS idx_entries_inserted_at ON entries(inserted_at DESC);
CREATE INDEX IF NOT EXISTS idx_entries_published_at ON entries(published_at DESC);

-- fetch_logs table
CREATE TABLE IF NOT EXISTS fetch_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'success', 'error')),
    message TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_ms INTEGER,
    item_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_fetch_logs_feed_id ON fetch_logs(feed_id);
CREATE INDEX IF NOT EXISTS idx_fetch_logs_status ON fetch_logs(status);

-- pipeline_settings table (singleton row, id = 1)
CREATE TABLE IF NOT EXISTS pipeline_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    tags_version INTEGER NOT NULL DEFAULT 1,
    auto_tagging INTEGER NOT NULL DEFAULT 0,
    auto_tagging_start_at TEXT,
    updated_at TEXT
);

INSERT OR IGNORE INTO pipeline_settings (id) VALUES (1);

-- user_tags table
CREATE TABLE IF NOT EXISTS user_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    match_mode TEXT NOT NULL DEFAULT 'ai',
    match_rules TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- entry_tags table
CREATE TABLE IF NOT EXISTS entry_tags (
    entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES user_tags(id) ON DELETE CASCADE,
    is_manual INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (entry_id, tag_id)
);

CREATE INDEX IF NOT EXISTS idx_entry_tags_tag_id ON entry_tags(tag_id);

-- entry_analysis_status table (rows created lazily)
CREATE TABLE IF NOT EXISTS entry_analysis_status (
    entry_id INTEGER PRIMARY KEY REFERENCES entries(id) ON DELETE CASCADE,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'analyzed', 'skipped')),
    analyzed_at TEXT,
    tags_version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_entry_analysis_status_status ON entry_analysis_status(status);

-- vector_records table (one row per vectorized entry)
CREATE TABLE IF NOT EXISTS vector_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id INTEGER NOT NULL UNIQUE REFERENCES entries(id) ON DELETE CASCADE,
    feed_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    published_at TEXT,
    url TEXT,
    created_at TEXT NOT NULL
);

-- vector_index table (keyed by the vector_records id)
CREATE TABLE IF NOT EXISTS vector_index (
    record_id INTEGER PRIMARY KEY REFERENCES vector_records(id) ON DELETE CASCADE,
    dim INTEGER NOT NULL,
    embedding BLOB NOT NULL
);
"#;
