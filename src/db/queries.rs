// Database queries: CRUD operations for all tables.
//
// Every database interaction goes through this module. This keeps SQL
// contained in one place and gives the rest of the app clean Rust interfaces.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use super::models::{
    ArchiveRow, BackfillRun, ChangeEvent, ClassificationEvidence, CollectionLogEntry, DailyCountsRow,
    DailyEngagementRollup, DateCounts, Direction, EngagementBalance, EngagementCounts,
    EventSource, FollowerVelocity, GivenEngagement, GivenKind, HiddenAccountRecord,
    InteractionCounts, InteractionRow, LookupStatus, Member, MemberSnapshot, MergeStats, PostEngagement,
    RelationKind, RemovalCause, RunStatus,
};
use crate::error::TrackerError;

// Enum columns are stored as their snake_case names.
macro_rules! sql_text_enum {
    ($($t:ty),* $(,)?) => {$(
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                <$t>::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

sql_text_enum!(
    RelationKind,
    Direction,
    EventSource,
    RemovalCause,
    LookupStatus,
    GivenKind,
    RunStatus,
);

/// What happened when a row was merged under its dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Same key, same payload; nothing to do.
    Duplicate,
    /// Same key, different payload. The existing row wins.
    Conflict,
}

// --- Scan state ---

/// Get a scan state value by key (e.g., "last_collection_at").
pub fn get_scan_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM scan_state WHERE key = ?1")?;
    let result = stmt.query_row(params![key], |row| row.get(0)).optional()?;
    Ok(result)
}

/// Set a scan state value (upsert).
pub fn set_scan_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO scan_state (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
        params![key, value],
    )?;
    Ok(())
}

// --- Snapshots ---

/// Write a snapshot. Snapshots are immutable: a second write for the same
/// (date, kind) is rejected as a validation error.
pub fn insert_snapshot(conn: &Connection, snapshot: &MemberSnapshot) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM snapshots WHERE snapshot_date = ?1 AND kind = ?2",
        params![snapshot.date, snapshot.kind],
        |row| row.get(0),
    )?;
    if exists {
        return Err(TrackerError::Validation(format!(
            "{} snapshot for {} already captured",
            snapshot.kind, snapshot.date
        ))
        .into());
    }

    tx.execute(
        "INSERT INTO snapshots (snapshot_date, kind, member_count) VALUES (?1, ?2, ?3)",
        params![snapshot.date, snapshot.kind, snapshot.len() as i64],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO member_snapshots (snapshot_date, kind, stable_id, handle)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for m in snapshot.members() {
            stmt.execute(params![snapshot.date, snapshot.kind, m.stable_id, m.handle])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Load the snapshot for a date and kind, members ordered by stable_id.
pub fn get_snapshot(
    conn: &Connection,
    date: NaiveDate,
    kind: RelationKind,
) -> Result<Option<MemberSnapshot>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM snapshots WHERE snapshot_date = ?1 AND kind = ?2",
        params![date, kind],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }

    let mut stmt = conn.prepare(
        "SELECT stable_id, handle FROM member_snapshots
         WHERE snapshot_date = ?1 AND kind = ?2
         ORDER BY stable_id",
    )?;
    let members = stmt
        .query_map(params![date, kind], |row| {
            Ok(Member {
                stable_id: row.get(0)?,
                handle: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let snapshot = MemberSnapshot::new(date, kind, members)
        .with_context(|| format!("Stored {kind} snapshot for {date} is malformed"))?;
    Ok(Some(snapshot))
}

/// The most recent snapshot date strictly before `date` for a kind.
pub fn previous_snapshot_date(
    conn: &Connection,
    date: NaiveDate,
    kind: RelationKind,
) -> Result<Option<NaiveDate>> {
    let prev = conn.query_row(
        "SELECT MAX(snapshot_date) FROM snapshots WHERE kind = ?1 AND snapshot_date < ?2",
        params![kind, date],
        |row| row.get::<_, Option<NaiveDate>>(0),
    )?;
    Ok(prev)
}

pub fn latest_snapshot_date(conn: &Connection, kind: RelationKind) -> Result<Option<NaiveDate>> {
    let latest = conn.query_row(
        "SELECT MAX(snapshot_date) FROM snapshots WHERE kind = ?1",
        params![kind],
        |row| row.get::<_, Option<NaiveDate>>(0),
    )?;
    Ok(latest)
}

/// All snapshot dates for a kind, oldest first.
pub fn snapshot_dates(conn: &Connection, kind: RelationKind) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT snapshot_date FROM snapshots WHERE kind = ?1 ORDER BY snapshot_date",
    )?;
    let dates = stmt
        .query_map(params![kind], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<NaiveDate>>>()?;
    Ok(dates)
}

// --- Change events ---

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEvent> {
    Ok(ChangeEvent {
        date: row.get(0)?,
        kind: row.get(1)?,
        direction: row.get(2)?,
        stable_id: row.get(3)?,
        handle: row.get(4)?,
        cause: row.get(5)?,
        source: row.get(6)?,
    })
}

/// Replace the live-derived events for one (date, kind) with a fresh diff.
///
/// Backfill rows for the same date are left alone; a live event whose key
/// already exists as a backfill row is not inserted twice. Returns the
/// number of rows inserted.
pub fn replace_live_events(
    conn: &Connection,
    date: NaiveDate,
    kind: RelationKind,
    events: &[ChangeEvent],
) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM change_events WHERE event_date = ?1 AND kind = ?2 AND source = 'live'",
        params![date, kind],
    )?;

    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO change_events
                (event_date, kind, direction, stable_id, handle, cause, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(stable_id, event_date, kind, direction) DO NOTHING",
        )?;
        for e in events {
            inserted += stmt.execute(params![
                e.date,
                e.kind,
                e.direction,
                e.stable_id,
                e.handle,
                e.cause,
                EventSource::Live,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Merge one archive-derived event under its dedup key.
///
/// The cause is the only payload compared: handles are display data, and
/// archive records don't carry them.
pub fn merge_event(conn: &Connection, event: &ChangeEvent, run_id: i64) -> Result<MergeOutcome> {
    let existing: Option<Option<RemovalCause>> = conn
        .query_row(
            "SELECT cause FROM change_events
             WHERE stable_id = ?1 AND event_date = ?2 AND kind = ?3 AND direction = ?4",
            params![event.stable_id, event.date, event.kind, event.direction],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(cause) if cause == event.cause => Ok(MergeOutcome::Duplicate),
        Some(_) => Ok(MergeOutcome::Conflict),
        None => {
            conn.execute(
                "INSERT INTO change_events
                    (event_date, kind, direction, stable_id, handle, cause, source, backfill_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.date,
                    event.kind,
                    event.direction,
                    event.stable_id,
                    event.handle,
                    event.cause,
                    event.source,
                    run_id,
                ],
            )?;
            Ok(MergeOutcome::Inserted)
        }
    }
}

/// All events on or after `since`, optionally for one kind.
pub fn get_changes_since(
    conn: &Connection,
    since: NaiveDate,
    kind: Option<RelationKind>,
) -> Result<Vec<ChangeEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_date, kind, direction, stable_id, handle, cause, source
         FROM change_events
         WHERE event_date >= ?1 AND (?2 IS NULL OR kind = ?2)
         ORDER BY event_date, kind, direction, stable_id",
    )?;
    let events = stmt
        .query_map(params![since, kind], map_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Removed-follower events for one date.
pub fn get_removed_followers(conn: &Connection, date: NaiveDate) -> Result<Vec<ChangeEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_date, kind, direction, stable_id, handle, cause, source
         FROM change_events
         WHERE event_date = ?1 AND kind = 'followers' AND direction = 'removed'
         ORDER BY stable_id",
    )?;
    let events = stmt
        .query_map(params![date], map_event)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Dates that have at least one removed-follower event, on or after `since`.
pub fn removal_dates_since(conn: &Connection, since: NaiveDate) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT event_date FROM change_events
         WHERE event_date >= ?1 AND kind = 'followers' AND direction = 'removed'
         ORDER BY event_date",
    )?;
    let dates = stmt
        .query_map(params![since], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<NaiveDate>>>()?;
    Ok(dates)
}

/// Accounts known from the archive to have been blocked on or before `date`.
pub fn archive_blocked_as_of(conn: &Connection, date: NaiveDate) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT stable_id FROM change_events
         WHERE kind = 'blocked' AND direction = 'added' AND source = 'backfill'
           AND event_date <= ?1",
    )?;
    let ids = stmt
        .query_map(params![date], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(ids)
}

/// New and lost followers/following per date.
pub fn get_follower_velocity(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<FollowerVelocity>> {
    let mut stmt = conn.prepare(
        "SELECT event_date,
                SUM(kind = 'followers' AND direction = 'added'),
                SUM(kind = 'followers' AND direction = 'removed'),
                SUM(kind = 'following' AND direction = 'added'),
                SUM(kind = 'following' AND direction = 'removed')
         FROM change_events
         WHERE event_date BETWEEN ?1 AND ?2
         GROUP BY event_date
         ORDER BY event_date",
    )?;
    let rows = stmt
        .query_map(params![from, to], |row| {
            Ok(FollowerVelocity {
                date: row.get(0)?,
                new_followers: row.get(1)?,
                lost_followers: row.get(2)?,
                new_following: row.get(3)?,
                lost_following: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// --- Daily counts and profile lookups ---

pub fn upsert_daily_counts(
    conn: &Connection,
    counts: &DateCounts,
    muted_count: i64,
    blocked_count: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO daily_counts
            (count_date, reported_followers, reported_following, api_followers, api_following,
             muted_count, blocked_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(count_date) DO UPDATE SET
            reported_followers = ?2,
            reported_following = ?3,
            api_followers = ?4,
            api_following = ?5,
            muted_count = ?6,
            blocked_count = ?7",
        params![
            counts.date,
            counts.reported_followers,
            counts.reported_following,
            counts.api_followers,
            counts.api_following,
            muted_count,
            blocked_count,
        ],
    )?;
    Ok(())
}

pub fn get_date_counts(conn: &Connection, date: NaiveDate) -> Result<Option<DateCounts>> {
    let counts = conn
        .query_row(
            "SELECT count_date, reported_followers, reported_following, api_followers, api_following
             FROM daily_counts WHERE count_date = ?1",
            params![date],
            |row| {
                Ok(DateCounts {
                    date: row.get(0)?,
                    reported_followers: row.get(1)?,
                    reported_following: row.get(2)?,
                    api_followers: row.get(3)?,
                    api_following: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(counts)
}

pub fn get_daily_counts(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyCountsRow>> {
    let mut stmt = conn.prepare(
        "SELECT count_date, reported_followers, reported_following, api_followers, api_following,
                muted_count, blocked_count
         FROM daily_counts
         WHERE count_date BETWEEN ?1 AND ?2
         ORDER BY count_date",
    )?;
    let rows = stmt
        .query_map(params![from, to], |row| {
            let counts = DateCounts {
                date: row.get(0)?,
                reported_followers: row.get(1)?,
                reported_following: row.get(2)?,
                api_followers: row.get(3)?,
                api_following: row.get(4)?,
            };
            let muted_count: i64 = row.get(5)?;
            let blocked_count: i64 = row.get(6)?;
            Ok(DailyCountsRow {
                suspected_count: (counts.hidden_followers() - muted_count - blocked_count).max(0),
                counts,
                muted_count,
                blocked_count,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn upsert_profile_lookup(
    conn: &Connection,
    stable_id: &str,
    date: NaiveDate,
    status: LookupStatus,
) -> Result<()> {
    conn.execute(
        "INSERT INTO profile_lookups (stable_id, lookup_date, status) VALUES (?1, ?2, ?3)
         ON CONFLICT(stable_id, lookup_date) DO UPDATE SET status = ?3",
        params![stable_id, date, status],
    )?;
    Ok(())
}

/// The recorded lookup for an account on a date, `NotChecked` if none.
pub fn get_profile_lookup(
    conn: &Connection,
    stable_id: &str,
    date: NaiveDate,
) -> Result<LookupStatus> {
    let status = conn
        .query_row(
            "SELECT status FROM profile_lookups WHERE stable_id = ?1 AND lookup_date = ?2",
            params![stable_id, date],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.unwrap_or(LookupStatus::NotChecked))
}

// --- Hidden accounts ---

/// Store a classification and stamp the cause on the matching event.
pub fn upsert_hidden_account(conn: &Connection, record: &HiddenAccountRecord) -> Result<()> {
    let evidence = serde_json::to_string(&record.evidence)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO hidden_accounts (stable_id, removal_date, handle, cause, evidence, classified_at)
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
         ON CONFLICT(stable_id, removal_date) DO UPDATE SET
            handle = ?3,
            cause = ?4,
            evidence = ?5,
            classified_at = datetime('now')",
        params![
            record.stable_id,
            record.removal_date,
            record.handle,
            record.cause,
            evidence,
        ],
    )?;
    tx.execute(
        "UPDATE change_events SET cause = ?3
         WHERE stable_id = ?1 AND event_date = ?2 AND kind = 'followers' AND direction = 'removed'",
        params![record.stable_id, record.removal_date, record.cause],
    )?;
    tx.commit()?;
    Ok(())
}

fn query_classifications(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
    hidden_only: bool,
) -> Result<Vec<HiddenAccountRecord>> {
    let mut stmt = conn.prepare(
        "SELECT stable_id, handle, removal_date, cause, evidence
         FROM hidden_accounts
         WHERE removal_date BETWEEN ?1 AND ?2
           AND (?3 = 0 OR cause != 'organic_unfollow')
         ORDER BY removal_date, stable_id",
    )?;
    let rows = stmt.query_map(params![from, to, hidden_only], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, NaiveDate>(2)?,
            row.get::<_, RemovalCause>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (stable_id, handle, removal_date, cause, evidence_json) = row?;
        let evidence: ClassificationEvidence = serde_json::from_str(&evidence_json)
            .with_context(|| format!("Bad evidence JSON for {stable_id} on {removal_date}"))?;
        records.push(HiddenAccountRecord {
            stable_id,
            handle,
            removal_date,
            cause,
            evidence,
        });
    }
    Ok(records)
}

/// Removals classified as anything other than an organic unfollow.
pub fn get_hidden_accounts(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<HiddenAccountRecord>> {
    query_classifications(conn, from, to, true)
}

/// Every classified removal in the range, organic ones included.
pub fn get_classifications(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<HiddenAccountRecord>> {
    query_classifications(conn, from, to, false)
}

// --- Post engagement ---

fn map_post(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostEngagement> {
    Ok(PostEngagement {
        post_uri: row.get(0)?,
        observed_on: row.get(1)?,
        created_at: row.get(2)?,
        text: row.get(3)?,
        is_reply: row.get(4)?,
        reply_to_uri: row.get(5)?,
        direct: EngagementCounts {
            likes: row.get(6)?,
            reposts: row.get(7)?,
            replies: row.get(8)?,
            quotes: row.get(9)?,
            bookmarks: row.get(10)?,
        },
        indirect: EngagementCounts {
            likes: row.get(11)?,
            reposts: row.get(12)?,
            replies: row.get(13)?,
            quotes: row.get(14)?,
            bookmarks: row.get(15)?,
        },
        source: row.get(16)?,
    })
}

const POST_COLUMNS: &str = "post_uri, observed_on, created_at, post_text, is_reply, reply_to_uri,
    like_count, repost_count, reply_count, quote_count, bookmark_count,
    indirect_likes, indirect_reposts, indirect_replies, indirect_quotes, indirect_bookmarks,
    source";

/// Insert one post observation under the (post_uri, observed_on) key.
///
/// An existing row wins, except that a live observation replaces an archive
/// row for the same day. It counts as a conflict when the creation time or
/// counts differ from what we tried to write.
pub fn insert_post_observation(conn: &Connection, post: &PostEngagement) -> Result<MergeOutcome> {
    let existing = conn
        .query_row(
            &format!(
                "SELECT {POST_COLUMNS} FROM post_engagement WHERE post_uri = ?1 AND observed_on = ?2"
            ),
            params![post.post_uri, post.observed_on],
            map_post,
        )
        .optional()?;

    if let Some(existing) = existing {
        if existing.created_at != post.created_at {
            return Ok(MergeOutcome::Conflict);
        }
        match (existing.source, post.source) {
            // Archive rows carry no metrics; a live row already covers the post
            (EventSource::Live, EventSource::Backfill) => return Ok(MergeOutcome::Duplicate),
            (EventSource::Backfill, EventSource::Live) => {
                conn.execute(
                    "DELETE FROM post_engagement WHERE post_uri = ?1 AND observed_on = ?2",
                    params![post.post_uri, post.observed_on],
                )?;
            }
            _ => {
                let same = existing.direct == post.direct && existing.indirect == post.indirect;
                return Ok(if same {
                    MergeOutcome::Duplicate
                } else {
                    MergeOutcome::Conflict
                });
            }
        }
    }

    conn.execute(
        "INSERT INTO post_engagement
            (post_uri, observed_on, created_at, created_on, post_text, is_reply, reply_to_uri,
             like_count, repost_count, reply_count, quote_count, bookmark_count,
             indirect_likes, indirect_reposts, indirect_replies, indirect_quotes, indirect_bookmarks,
             source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            post.post_uri,
            post.observed_on,
            post.created_at,
            post.created_on(),
            post.text,
            post.is_reply,
            post.reply_to_uri,
            post.direct.likes,
            post.direct.reposts,
            post.direct.replies,
            post.direct.quotes,
            post.direct.bookmarks,
            post.indirect.likes,
            post.indirect.reposts,
            post.indirect.replies,
            post.indirect.quotes,
            post.indirect.bookmarks,
            post.source,
        ],
    )?;
    Ok(MergeOutcome::Inserted)
}

/// Every stored observation of posts created on `date`.
pub fn get_posts_created_on(conn: &Connection, date: NaiveDate) -> Result<Vec<PostEngagement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM post_engagement
         WHERE created_on = ?1
         ORDER BY post_uri, observed_on"
    ))?;
    let posts = stmt
        .query_map(params![date], map_post)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(posts)
}

/// Distinct creation dates of stored posts, oldest first.
pub fn post_creation_dates(conn: &Connection) -> Result<Vec<NaiveDate>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT created_on FROM post_engagement ORDER BY created_on")?;
    let dates = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<NaiveDate>>>()?;
    Ok(dates)
}

// --- Rollups ---

pub fn upsert_rollup(conn: &Connection, rollup: &DailyEngagementRollup) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO daily_rollups
            (rollup_date, post_count, posts_with_engagement,
             total_likes, total_reposts, total_replies, total_quotes, total_bookmarks,
             total_indirect_likes, total_indirect_reposts, total_indirect_replies,
             total_indirect_quotes, total_indirect_bookmarks,
             total_score, average_score, best_post_uri, best_post_score, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 datetime('now'))",
        params![
            rollup.date,
            rollup.post_count,
            rollup.posts_with_engagement,
            rollup.direct.likes,
            rollup.direct.reposts,
            rollup.direct.replies,
            rollup.direct.quotes,
            rollup.direct.bookmarks,
            rollup.indirect.likes,
            rollup.indirect.reposts,
            rollup.indirect.replies,
            rollup.indirect.quotes,
            rollup.indirect.bookmarks,
            rollup.total_score,
            rollup.average_score,
            rollup.best_post_uri,
            rollup.best_post_score,
        ],
    )?;
    Ok(())
}

pub fn delete_rollup(conn: &Connection, date: NaiveDate) -> Result<()> {
    conn.execute(
        "DELETE FROM daily_rollups WHERE rollup_date = ?1",
        params![date],
    )?;
    Ok(())
}

fn map_rollup(row: &rusqlite::Row<'_>) -> rusqlite::Result<DailyEngagementRollup> {
    Ok(DailyEngagementRollup {
        date: row.get(0)?,
        post_count: row.get(1)?,
        posts_with_engagement: row.get(2)?,
        direct: EngagementCounts {
            likes: row.get(3)?,
            reposts: row.get(4)?,
            replies: row.get(5)?,
            quotes: row.get(6)?,
            bookmarks: row.get(7)?,
        },
        indirect: EngagementCounts {
            likes: row.get(8)?,
            reposts: row.get(9)?,
            replies: row.get(10)?,
            quotes: row.get(11)?,
            bookmarks: row.get(12)?,
        },
        total_score: row.get(13)?,
        average_score: row.get(14)?,
        best_post_uri: row.get(15)?,
        best_post_score: row.get(16)?,
    })
}

pub fn get_rollups(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<DailyEngagementRollup>> {
    let mut stmt = conn.prepare(
        "SELECT rollup_date, post_count, posts_with_engagement,
                total_likes, total_reposts, total_replies, total_quotes, total_bookmarks,
                total_indirect_likes, total_indirect_reposts, total_indirect_replies,
                total_indirect_quotes, total_indirect_bookmarks,
                total_score, average_score, best_post_uri, best_post_score
         FROM daily_rollups
         WHERE rollup_date BETWEEN ?1 AND ?2
         ORDER BY rollup_date",
    )?;
    let rollups = stmt
        .query_map(params![from, to], map_rollup)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rollups)
}

// --- Interactions ---

pub fn upsert_interactions(conn: &Connection, rows: &[InteractionRow]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO interactions
                (stable_id, interaction_date, handle, likes, reposts, replies, quotes, follows,
                 last_interaction)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(stable_id, interaction_date) DO UPDATE SET
                handle = ?3, likes = ?4, reposts = ?5, replies = ?6, quotes = ?7,
                follows = ?8, last_interaction = ?9",
        )?;
        for r in rows {
            stmt.execute(params![
                r.stable_id,
                r.date,
                r.handle,
                r.counts.likes,
                r.counts.reposts,
                r.counts.replies,
                r.counts.quotes,
                r.counts.follows,
                r.last_interaction,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn get_interaction_rows(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<InteractionRow>> {
    let mut stmt = conn.prepare(
        "SELECT stable_id, handle, interaction_date, likes, reposts, replies, quotes, follows,
                last_interaction
         FROM interactions
         WHERE interaction_date BETWEEN ?1 AND ?2
         ORDER BY interaction_date, stable_id",
    )?;
    let rows = stmt
        .query_map(params![from, to], |row| {
            Ok(InteractionRow {
                stable_id: row.get(0)?,
                handle: row.get(1)?,
                date: row.get(2)?,
                counts: InteractionCounts {
                    likes: row.get(3)?,
                    reposts: row.get(4)?,
                    replies: row.get(5)?,
                    quotes: row.get(6)?,
                    follows: row.get(7)?,
                },
                last_interaction: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// --- Given engagement ---

pub fn merge_given(conn: &Connection, given: &GivenEngagement, run_id: i64) -> Result<MergeOutcome> {
    let existing = conn
        .query_row(
            "SELECT kind, subject_uri, created_at FROM given_engagement WHERE record_uri = ?1",
            params![given.record_uri],
            |row| {
                Ok((
                    row.get::<_, GivenKind>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                ))
            },
        )
        .optional()?;

    match existing {
        Some((kind, subject, created_at))
            if kind == given.kind && subject == given.subject_uri && created_at == given.created_at =>
        {
            Ok(MergeOutcome::Duplicate)
        }
        Some(_) => Ok(MergeOutcome::Conflict),
        None => {
            conn.execute(
                "INSERT INTO given_engagement
                    (record_uri, kind, subject_uri, subject_author_did, created_at, backfill_run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    given.record_uri,
                    given.kind,
                    given.subject_uri,
                    given.subject_author_did,
                    given.created_at,
                    run_id,
                ],
            )?;
            Ok(MergeOutcome::Inserted)
        }
    }
}

/// Likes, reposts and replies-to-others the user gave. Replies into the
/// user's own threads are not engagement and are excluded.
pub fn engagement_balance(conn: &Connection, user_did: &str) -> Result<EngagementBalance> {
    let (likes, reposts): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(kind = 'like'), 0), COALESCE(SUM(kind = 'repost'), 0)
         FROM given_engagement",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let own_prefix = format!("at://{user_did}/%");
    let replies: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT post_uri) FROM post_engagement
         WHERE is_reply = 1 AND reply_to_uri IS NOT NULL AND reply_to_uri NOT LIKE ?1",
        params![own_prefix],
        |row| row.get(0),
    )?;

    let (likes, reposts, replies) = (likes as u64, reposts as u64, replies as u64);
    Ok(EngagementBalance {
        likes,
        reposts,
        replies,
        total: likes + reposts + replies,
    })
}

// --- Archive merge ---

/// Merge a batch of archive rows in one transaction.
///
/// Either the whole batch lands or none of it does. Rows already present
/// under their dedup key are skipped; differing payloads are reported as
/// conflicts and the stored row is kept.
pub fn merge_archive_batch(conn: &Connection, run_id: i64, rows: &[ArchiveRow]) -> Result<MergeStats> {
    let tx = conn.unchecked_transaction()?;
    let mut stats = MergeStats::default();

    for row in rows {
        let outcome = match row {
            ArchiveRow::Event(e) => merge_event(&tx, e, run_id)?,
            ArchiveRow::Post(p) => insert_post_observation(&tx, p)?,
            ArchiveRow::Given(g) => merge_given(&tx, g, run_id)?,
        };
        match outcome {
            MergeOutcome::Inserted => stats.inserted += 1,
            MergeOutcome::Duplicate => stats.duplicates += 1,
            MergeOutcome::Conflict => stats.conflicts.push(row.dedup_key()),
        }
    }

    tx.commit().context("Failed to commit archive batch")?;
    Ok(stats)
}

// --- Backfill runs ---

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackfillRun> {
    Ok(BackfillRun {
        id: row.get(0)?,
        source_archive_hash: row.get(1)?,
        repo_did: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        status: row.get(5)?,
        earliest_date: row.get(6)?,
        latest_date: row.get(7)?,
        blocks_read: row.get::<_, i64>(8)? as u64,
        records_seen: row.get::<_, i64>(9)? as u64,
        rows_merged: row.get::<_, i64>(10)? as u64,
        duplicates_skipped: row.get::<_, i64>(11)? as u64,
        merge_conflicts: row.get::<_, i64>(12)? as u64,
        unrecoverable_records: row.get::<_, i64>(13)? as u64,
        error: row.get(14)?,
    })
}

const RUN_COLUMNS: &str = "id, source_archive_hash, repo_did, started_at, finished_at, status,
    earliest_date, latest_date, blocks_read, records_seen, rows_merged, duplicates_skipped,
    merge_conflicts, unrecoverable_records, error";

/// Create a run row in `running` state and return its id.
pub fn insert_backfill_run(
    conn: &Connection,
    source_archive_hash: &str,
    started_at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO backfill_runs (source_archive_hash, started_at, status) VALUES (?1, ?2, ?3)",
        params![source_archive_hash, started_at, RunStatus::Running],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write the run's current counters and status.
pub fn update_backfill_run(conn: &Connection, run: &BackfillRun) -> Result<()> {
    conn.execute(
        "UPDATE backfill_runs SET
            repo_did = ?2, finished_at = ?3, status = ?4, earliest_date = ?5, latest_date = ?6,
            blocks_read = ?7, records_seen = ?8, rows_merged = ?9, duplicates_skipped = ?10,
            merge_conflicts = ?11, unrecoverable_records = ?12, error = ?13
         WHERE id = ?1",
        params![
            run.id,
            run.repo_did,
            run.finished_at,
            run.status,
            run.earliest_date,
            run.latest_date,
            run.blocks_read as i64,
            run.records_seen as i64,
            run.rows_merged as i64,
            run.duplicates_skipped as i64,
            run.merge_conflicts as i64,
            run.unrecoverable_records as i64,
            run.error,
        ],
    )?;
    Ok(())
}

pub fn get_backfill_run(conn: &Connection, id: i64) -> Result<Option<BackfillRun>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM backfill_runs WHERE id = ?1"),
            params![id],
            map_run,
        )
        .optional()?;
    Ok(run)
}

/// All runs, most recent first.
pub fn list_backfill_runs(conn: &Connection) -> Result<Vec<BackfillRun>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM backfill_runs ORDER BY id DESC"
    ))?;
    let runs = stmt
        .query_map([], map_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

/// The id of a completed run for this archive hash, if any.
pub fn find_completed_run(conn: &Connection, source_archive_hash: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM backfill_runs
             WHERE source_archive_hash = ?1 AND status = 'completed'
             ORDER BY id LIMIT 1",
            params![source_archive_hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

// --- Collection log ---

pub fn log_collection(conn: &Connection, entry: &CollectionLogEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO collection_log
            (collection_date, status, followers_collected, following_collected, error, duration_secs)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.collection_date,
            entry.status,
            entry.followers_collected,
            entry.following_collected,
            entry.error,
            entry.duration_secs,
        ],
    )?;
    Ok(())
}

/// Whether any log entry for `date` carries `status`.
pub fn has_logged_collection(conn: &Connection, date: NaiveDate, status: &str) -> Result<bool> {
    let found = conn.query_row(
        "SELECT COUNT(*) > 0 FROM collection_log WHERE collection_date = ?1 AND status = ?2",
        params![date, status],
        |row| row.get(0),
    )?;
    Ok(found)
}

pub fn recent_collections(conn: &Connection, limit: u32) -> Result<Vec<CollectionLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT collection_date, status, followers_collected, following_collected, error,
                duration_secs
         FROM collection_log
         ORDER BY id DESC
         LIMIT ?1",
    )?;
    let entries = stmt
        .query_map(params![limit], |row| {
            Ok(CollectionLogEntry {
                collection_date: row.get(0)?,
                status: row.get(1)?,
                followers_collected: row.get(2)?,
                following_collected: row.get(3)?,
                error: row.get(4)?,
                duration_secs: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

// --- Mutual views on the latest snapshots ---

fn latest_members_not_in(
    conn: &Connection,
    kind: RelationKind,
    other: RelationKind,
) -> Result<Vec<Member>> {
    let (Some(date), Some(other_date)) = (
        latest_snapshot_date(conn, kind)?,
        latest_snapshot_date(conn, other)?,
    ) else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(
        "SELECT m.stable_id, m.handle FROM member_snapshots m
         WHERE m.snapshot_date = ?1 AND m.kind = ?2
           AND NOT EXISTS (
               SELECT 1 FROM member_snapshots o
               WHERE o.snapshot_date = ?3 AND o.kind = ?4 AND o.stable_id = m.stable_id
           )
         ORDER BY m.handle",
    )?;
    let members = stmt
        .query_map(params![date, kind, other_date, other], |row| {
            Ok(Member {
                stable_id: row.get(0)?,
                handle: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(members)
}

/// Accounts the user follows that don't follow back.
pub fn get_non_mutual_following(conn: &Connection) -> Result<Vec<Member>> {
    latest_members_not_in(conn, RelationKind::Following, RelationKind::Followers)
}

/// Followers the user doesn't follow back.
pub fn get_followers_only(conn: &Connection) -> Result<Vec<Member>> {
    latest_members_not_in(conn, RelationKind::Followers, RelationKind::Following)
}
