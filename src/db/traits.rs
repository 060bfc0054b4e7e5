// Database trait: async interface for every storage operation.
//
// Implementor: SqliteDatabase (wraps rusqlite). The pipeline, importer and
// CLI all hold an `Arc<dyn Database>`, so tests can run the same code against
// an in-memory database.
//
// The trait mirrors the free functions in queries.rs one-to-one.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::models::{
    ArchiveRow, BackfillRun, ChangeEvent, CollectionLogEntry, DailyCountsRow,
    DailyEngagementRollup, DateCounts, EngagementBalance, FollowerVelocity, HiddenAccountRecord,
    InteractionRow, LookupStatus, Member, MemberSnapshot, MergeStats, PostEngagement,
    RelationKind,
};
use super::queries::MergeOutcome;

#[async_trait]
pub trait Database: Send + Sync {
    // --- Lifecycle ---

    /// Count the number of user-created tables in the database.
    async fn table_count(&self) -> Result<i64>;

    // --- Scan state ---

    async fn get_scan_state(&self, key: &str) -> Result<Option<String>>;

    async fn set_scan_state(&self, key: &str, value: &str) -> Result<()>;

    // --- Snapshots ---

    /// Persist a snapshot. Fails with a validation error if one already
    /// exists for the same date and kind.
    async fn insert_snapshot(&self, snapshot: &MemberSnapshot) -> Result<()>;

    async fn get_snapshot(
        &self,
        date: NaiveDate,
        kind: RelationKind,
    ) -> Result<Option<MemberSnapshot>>;

    async fn previous_snapshot_date(
        &self,
        date: NaiveDate,
        kind: RelationKind,
    ) -> Result<Option<NaiveDate>>;

    async fn latest_snapshot_date(&self, kind: RelationKind) -> Result<Option<NaiveDate>>;

    async fn snapshot_dates(&self, kind: RelationKind) -> Result<Vec<NaiveDate>>;

    // --- Change events ---

    /// Swap the live events for (date, kind) for a fresh diff.
    async fn replace_live_events(
        &self,
        date: NaiveDate,
        kind: RelationKind,
        events: &[ChangeEvent],
    ) -> Result<usize>;

    async fn get_changes_since(
        &self,
        since: NaiveDate,
        kind: Option<RelationKind>,
    ) -> Result<Vec<ChangeEvent>>;

    async fn get_removed_followers(&self, date: NaiveDate) -> Result<Vec<ChangeEvent>>;

    async fn removal_dates_since(&self, since: NaiveDate) -> Result<Vec<NaiveDate>>;

    async fn archive_blocked_as_of(&self, date: NaiveDate) -> Result<HashSet<String>>;

    async fn get_follower_velocity(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FollowerVelocity>>;

    // --- Counts and lookups ---

    async fn upsert_daily_counts(
        &self,
        counts: &DateCounts,
        muted_count: i64,
        blocked_count: i64,
    ) -> Result<()>;

    async fn get_date_counts(&self, date: NaiveDate) -> Result<Option<DateCounts>>;

    async fn get_daily_counts(&self, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<DailyCountsRow>>;

    async fn upsert_profile_lookup(
        &self,
        stable_id: &str,
        date: NaiveDate,
        status: LookupStatus,
    ) -> Result<()>;

    async fn get_profile_lookup(&self, stable_id: &str, date: NaiveDate) -> Result<LookupStatus>;

    // --- Hidden accounts ---

    async fn upsert_hidden_account(&self, record: &HiddenAccountRecord) -> Result<()>;

    /// Removals classified as anything but organic, in the date range.
    async fn get_hidden_accounts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HiddenAccountRecord>>;

    async fn get_classifications(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HiddenAccountRecord>>;

    // --- Engagement ---

    async fn insert_post_observation(&self, post: &PostEngagement) -> Result<MergeOutcome>;

    async fn get_posts_created_on(&self, date: NaiveDate) -> Result<Vec<PostEngagement>>;

    async fn post_creation_dates(&self) -> Result<Vec<NaiveDate>>;

    async fn upsert_rollup(&self, rollup: &DailyEngagementRollup) -> Result<()>;

    async fn delete_rollup(&self, date: NaiveDate) -> Result<()>;

    async fn get_rollups(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyEngagementRollup>>;

    async fn upsert_interactions(&self, rows: &[InteractionRow]) -> Result<()>;

    async fn get_interaction_rows(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<InteractionRow>>;

    async fn engagement_balance(&self, user_did: &str) -> Result<EngagementBalance>;

    // --- Backfill ---

    async fn merge_archive_batch(&self, run_id: i64, rows: &[ArchiveRow]) -> Result<MergeStats>;

    async fn insert_backfill_run(
        &self,
        source_archive_hash: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64>;

    async fn update_backfill_run(&self, run: &BackfillRun) -> Result<()>;

    async fn get_backfill_run(&self, id: i64) -> Result<Option<BackfillRun>>;

    async fn list_backfill_runs(&self) -> Result<Vec<BackfillRun>>;

    async fn find_completed_run(&self, source_archive_hash: &str) -> Result<Option<i64>>;

    // --- Collection log ---

    async fn log_collection(&self, entry: &CollectionLogEntry) -> Result<()>;

    async fn has_logged_collection(&self, date: NaiveDate, status: &str) -> Result<bool>;

    async fn recent_collections(&self, limit: u32) -> Result<Vec<CollectionLogEntry>>;

    // --- Mutual views ---

    async fn get_non_mutual_following(&self) -> Result<Vec<Member>>;

    async fn get_followers_only(&self) -> Result<Vec<Member>>;
}
