//! SQL migration definitions for the Leadflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: cache_entries, lead_records",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Raw provider payloads, one row per (provider, identifier)
CREATE TABLE IF NOT EXISTS cache_entries (
    provider_id   TEXT NOT NULL,
    identifier    TEXT NOT NULL,
    payload_json  TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (provider_id, identifier)
);

CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at_ms);

-- Finalized lead records, latest run wins
CREATE TABLE IF NOT EXISTS lead_records (
    identifier   TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL,
    score        INTEGER,
    record_json  TEXT NOT NULL,
    finalized_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lead_records_score ON lead_records(score);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
