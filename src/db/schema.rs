//! Database schema definitions

pub const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp BIGINT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    port INTEGER,
    source TEXT,
    classification TEXT,
    fields TEXT
)
"#;

// For recent-event listing and time filtering
pub const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)";

// For per-port history
pub const CREATE_INDEX_PORT: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_port ON events(port, timestamp)";

// For IP lookups
pub const CREATE_INDEX_SOURCE: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_source ON events(source) WHERE source IS NOT NULL";
