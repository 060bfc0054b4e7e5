// Database schema: table creation and migrations.
//
// We use a simple version-based migration approach: a `schema_version` table
// tracks which migrations have run, and each migration is a function that
// executes SQL statements.
//
// Dates are stored as `YYYY-MM-DD` text and timestamps as RFC 3339 text, so
// lexical order is chronological order.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// Create all tables if they don't exist yet.
///
/// Idempotent: safe to call on every startup.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Tracks schema version for future migrations
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One row per captured relation set, so empty sets still exist
        CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_date TEXT NOT NULL,
            kind TEXT NOT NULL,                -- followers / following / muted / blocked
            member_count INTEGER NOT NULL,
            captured_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (snapshot_date, kind)
        );

        -- Members of each snapshot (append-only)
        CREATE TABLE IF NOT EXISTS member_snapshots (
            snapshot_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            stable_id TEXT NOT NULL,           -- DID
            handle TEXT NOT NULL,
            UNIQUE (snapshot_date, kind, stable_id)
        );

        -- Derived membership transitions (live diffs and archive records)
        CREATE TABLE IF NOT EXISTS change_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            direction TEXT NOT NULL,           -- added / removed
            stable_id TEXT NOT NULL,
            handle TEXT NOT NULL,
            cause TEXT,                        -- removal cause for removed followers
            source TEXT NOT NULL,              -- live / backfill
            UNIQUE (stable_id, event_date, kind, direction)
        );

        -- Classification of removed followers, with the evidence used
        CREATE TABLE IF NOT EXISTS hidden_accounts (
            stable_id TEXT NOT NULL,
            removal_date TEXT NOT NULL,
            handle TEXT NOT NULL,
            cause TEXT NOT NULL,
            evidence TEXT NOT NULL,            -- JSON ClassificationEvidence
            classified_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (stable_id, removal_date)
        );

        -- Profile-reported vs API-visible counts per day
        CREATE TABLE IF NOT EXISTS daily_counts (
            count_date TEXT PRIMARY KEY,
            reported_followers INTEGER NOT NULL,
            reported_following INTEGER NOT NULL,
            api_followers INTEGER NOT NULL,
            api_following INTEGER NOT NULL,
            muted_count INTEGER NOT NULL DEFAULT 0,
            blocked_count INTEGER NOT NULL DEFAULT 0
        );

        -- Direct profile lookups for removed accounts
        CREATE TABLE IF NOT EXISTS profile_lookups (
            stable_id TEXT NOT NULL,
            lookup_date TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY (stable_id, lookup_date)
        );

        -- Per-post metrics, one row per observation
        CREATE TABLE IF NOT EXISTS post_engagement (
            post_uri TEXT NOT NULL,
            observed_on TEXT NOT NULL,
            created_at TEXT NOT NULL,
            created_on TEXT NOT NULL,          -- date part of created_at, for rollups
            post_text TEXT,
            is_reply INTEGER NOT NULL DEFAULT 0,
            like_count INTEGER NOT NULL DEFAULT 0,
            repost_count INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER NOT NULL DEFAULT 0,
            quote_count INTEGER NOT NULL DEFAULT 0,
            bookmark_count INTEGER NOT NULL DEFAULT 0,
            indirect_likes INTEGER NOT NULL DEFAULT 0,
            indirect_reposts INTEGER NOT NULL DEFAULT 0,
            indirect_replies INTEGER NOT NULL DEFAULT 0,
            indirect_quotes INTEGER NOT NULL DEFAULT 0,
            indirect_bookmarks INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            UNIQUE (post_uri, observed_on)
        );

        -- Daily engagement rollups, always recomputed from post_engagement
        CREATE TABLE IF NOT EXISTS daily_rollups (
            rollup_date TEXT PRIMARY KEY,
            post_count INTEGER NOT NULL,
            posts_with_engagement INTEGER NOT NULL,
            total_likes INTEGER NOT NULL,
            total_reposts INTEGER NOT NULL,
            total_replies INTEGER NOT NULL,
            total_quotes INTEGER NOT NULL,
            total_bookmarks INTEGER NOT NULL,
            total_indirect_likes INTEGER NOT NULL,
            total_indirect_reposts INTEGER NOT NULL,
            total_indirect_replies INTEGER NOT NULL,
            total_indirect_quotes INTEGER NOT NULL,
            total_indirect_bookmarks INTEGER NOT NULL,
            total_score REAL NOT NULL,
            average_score REAL NOT NULL,
            best_post_uri TEXT,
            best_post_score REAL NOT NULL DEFAULT 0,
            computed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Interactions received, per account per day
        CREATE TABLE IF NOT EXISTS interactions (
            stable_id TEXT NOT NULL,
            interaction_date TEXT NOT NULL,
            handle TEXT NOT NULL,
            likes INTEGER NOT NULL DEFAULT 0,
            reposts INTEGER NOT NULL DEFAULT 0,
            replies INTEGER NOT NULL DEFAULT 0,
            quotes INTEGER NOT NULL DEFAULT 0,
            follows INTEGER NOT NULL DEFAULT 0,
            last_interaction TEXT,
            PRIMARY KEY (stable_id, interaction_date)
        );

        -- Likes and reposts the tracked user gave (from the archive)
        CREATE TABLE IF NOT EXISTS given_engagement (
            record_uri TEXT PRIMARY KEY,
            kind TEXT NOT NULL,                -- like / repost
            subject_uri TEXT NOT NULL,
            subject_author_did TEXT,
            created_at TEXT NOT NULL
        );

        -- Audit trail of archive imports (never deleted)
        CREATE TABLE IF NOT EXISTS backfill_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_archive_hash TEXT NOT NULL,
            repo_did TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            earliest_date TEXT,
            latest_date TEXT,
            blocks_read INTEGER NOT NULL DEFAULT 0,
            records_seen INTEGER NOT NULL DEFAULT 0,
            rows_merged INTEGER NOT NULL DEFAULT 0,
            duplicates_skipped INTEGER NOT NULL DEFAULT 0,
            merge_conflicts INTEGER NOT NULL DEFAULT 0,
            unrecoverable_records INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );

        -- One row per collection cycle attempt
        CREATE TABLE IF NOT EXISTS collection_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_date TEXT NOT NULL,
            status TEXT NOT NULL,              -- success / failed / skipped
            followers_collected INTEGER,
            following_collected INTEGER,
            error TEXT,
            duration_secs REAL NOT NULL,
            logged_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Scan state: last-collection timestamps and similar markers
        CREATE TABLE IF NOT EXISTS scan_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_events_date_kind
            ON change_events(event_date, kind);

        CREATE INDEX IF NOT EXISTS idx_hidden_date
            ON hidden_accounts(removal_date);

        CREATE INDEX IF NOT EXISTS idx_posts_created_on
            ON post_engagement(created_on);

        CREATE INDEX IF NOT EXISTS idx_interactions_date
            ON interactions(interaction_date);

        CREATE INDEX IF NOT EXISTS idx_runs_hash
            ON backfill_runs(source_archive_hash);
        ",
    )
    .context("Failed to create database tables")?;

    // Record initial schema version if not already set
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [1],
    )?;

    // Migration v2: keep the parent URI of reply posts so engagement
    // balance can tell replies to others from self-threads.
    run_migration(conn, 2, |c| {
        c.execute_batch("ALTER TABLE post_engagement ADD COLUMN reply_to_uri TEXT;")
    })?;

    // Migration v3: link change events and given engagement to the import
    // that produced them (NULL for live rows).
    run_migration(conn, 3, |c| {
        c.execute_batch(
            "ALTER TABLE change_events ADD COLUMN backfill_run_id INTEGER;
             ALTER TABLE given_engagement ADD COLUMN backfill_run_id INTEGER;",
        )
    })?;

    Ok(())
}

/// Run a migration if it hasn't been applied yet.
/// The migration function receives the connection and should execute its SQL.
fn run_migration<F>(conn: &Connection, version: i64, migrate: F) -> Result<()>
where
    F: FnOnce(&Connection) -> rusqlite::Result<()>,
{
    let already_applied: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM schema_version WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    if !already_applied {
        migrate(conn).with_context(|| format!("Migration v{version} failed"))?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [version],
        )?;
    }

    Ok(())
}

/// Count the number of tables in the database (useful for init confirmation).
pub fn table_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        // Running create_tables twice should not error
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
    }

    #[test]
    fn test_table_count() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let count = table_count(&conn).unwrap();
        assert_eq!(count, 14i64);
    }

    #[test]
    fn test_change_event_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let insert = "INSERT INTO change_events (event_date, kind, direction, stable_id, handle, source)
                      VALUES ('2024-01-02', 'followers', 'added', 'did:plc:a', 'a', 'live')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_migrations_recorded_once() {
        let conn = Connection::open_in_memory().unwrap();
        // Run create_tables three times; migrations should only run once
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_migration_v3_adds_run_link() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        conn.execute(
            "INSERT INTO given_engagement (record_uri, kind, subject_uri, created_at, backfill_run_id)
             VALUES ('at://did:plc:me/app.bsky.feed.like/1', 'like', 'at://x', '2024-01-01T00:00:00Z', 7)",
            [],
        )
        .unwrap();

        let run_id: i64 = conn
            .query_row("SELECT backfill_run_id FROM given_engagement", [], |row| row.get(0))
            .unwrap();
        assert_eq!(run_id, 7);
    }
}
