//! Database schema definitions

pub const CREATE_WEBSITES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS websites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

// One row per website: points at the current resource generation
pub const CREATE_SCANS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scans (
    website_id INTEGER PRIMARY KEY REFERENCES websites(id) ON DELETE CASCADE,
    generation TEXT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_RESOURCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id) ON DELETE CASCADE,
    generation TEXT NOT NULL,
    url TEXT NOT NULL,
    host TEXT NOT NULL,
    transfer_size INTEGER NOT NULL,
    content_size INTEGER NOT NULL,
    origin_ip TEXT,
    country_code TEXT,
    green INTEGER NOT NULL DEFAULT 0,
    updated_at BIGINT NOT NULL
)
"#;

pub const CREATE_PAGEVIEWS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pageviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    website_id INTEGER NOT NULL REFERENCES websites(id) ON DELETE CASCADE,
    visitor_id TEXT NOT NULL,
    country_code TEXT,
    timestamp BIGINT NOT NULL
)
"#;

// For loading the current generation of a website
pub const CREATE_INDEX_RESOURCES_WEBSITE: &str =
    "CREATE INDEX IF NOT EXISTS idx_resources_website ON resources(website_id, generation)";

// For the trailing pageview window
pub const CREATE_INDEX_PAGEVIEWS_WEBSITE_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_pageviews_website_ts ON pageviews(website_id, timestamp)";
