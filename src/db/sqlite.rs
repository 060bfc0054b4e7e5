// SqliteDatabase: rusqlite backend implementing the Database trait.
//
// The Connection is wrapped in tokio::sync::Mutex because Connection is !Send.
// Trait methods lock the mutex, do synchronous rusqlite work, and return.
// Locking the mutex serializes every statement, so a batch merge runs as one
// unit relative to everything else touching the file through this handle.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::models::{
    ArchiveRow, BackfillRun, ChangeEvent, CollectionLogEntry, DailyCountsRow,
    DailyEngagementRollup, DateCounts, EngagementBalance, FollowerVelocity, HiddenAccountRecord,
    InteractionRow, LookupStatus, Member, MemberSnapshot, MergeStats, PostEngagement,
    RelationKind,
};
use super::queries::MergeOutcome;
use super::traits::Database;

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Wrap an already-opened rusqlite Connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn table_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::schema::table_count(&conn)
    }

    async fn get_scan_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        super::queries::get_scan_state(&conn, key)
    }

    async fn set_scan_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::set_scan_state(&conn, key, value)
    }

    async fn insert_snapshot(&self, snapshot: &MemberSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::insert_snapshot(&conn, snapshot)
    }

    async fn get_snapshot(
        &self,
        date: NaiveDate,
        kind: RelationKind,
    ) -> Result<Option<MemberSnapshot>> {
        let conn = self.conn.lock().await;
        super::queries::get_snapshot(&conn, date, kind)
    }

    async fn previous_snapshot_date(
        &self,
        date: NaiveDate,
        kind: RelationKind,
    ) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().await;
        super::queries::previous_snapshot_date(&conn, date, kind)
    }

    async fn latest_snapshot_date(&self, kind: RelationKind) -> Result<Option<NaiveDate>> {
        let conn = self.conn.lock().await;
        super::queries::latest_snapshot_date(&conn, kind)
    }

    async fn snapshot_dates(&self, kind: RelationKind) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().await;
        super::queries::snapshot_dates(&conn, kind)
    }

    async fn replace_live_events(
        &self,
        date: NaiveDate,
        kind: RelationKind,
        events: &[ChangeEvent],
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        super::queries::replace_live_events(&conn, date, kind, events)
    }

    async fn get_changes_since(
        &self,
        since: NaiveDate,
        kind: Option<RelationKind>,
    ) -> Result<Vec<ChangeEvent>> {
        let conn = self.conn.lock().await;
        super::queries::get_changes_since(&conn, since, kind)
    }

    async fn get_removed_followers(&self, date: NaiveDate) -> Result<Vec<ChangeEvent>> {
        let conn = self.conn.lock().await;
        super::queries::get_removed_followers(&conn, date)
    }

    async fn removal_dates_since(&self, since: NaiveDate) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().await;
        super::queries::removal_dates_since(&conn, since)
    }

    async fn archive_blocked_as_of(&self, date: NaiveDate) -> Result<HashSet<String>> {
        let conn = self.conn.lock().await;
        super::queries::archive_blocked_as_of(&conn, date)
    }

    async fn get_follower_velocity(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FollowerVelocity>> {
        let conn = self.conn.lock().await;
        super::queries::get_follower_velocity(&conn, from, to)
    }

    async fn upsert_daily_counts(
        &self,
        counts: &DateCounts,
        muted_count: i64,
        blocked_count: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::upsert_daily_counts(&conn, counts, muted_count, blocked_count)
    }

    async fn get_date_counts(&self, date: NaiveDate) -> Result<Option<DateCounts>> {
        let conn = self.conn.lock().await;
        super::queries::get_date_counts(&conn, date)
    }

    async fn get_daily_counts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyCountsRow>> {
        let conn = self.conn.lock().await;
        super::queries::get_daily_counts(&conn, from, to)
    }

    async fn upsert_profile_lookup(
        &self,
        stable_id: &str,
        date: NaiveDate,
        status: LookupStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::upsert_profile_lookup(&conn, stable_id, date, status)
    }

    async fn get_profile_lookup(&self, stable_id: &str, date: NaiveDate) -> Result<LookupStatus> {
        let conn = self.conn.lock().await;
        super::queries::get_profile_lookup(&conn, stable_id, date)
    }

    async fn upsert_hidden_account(&self, record: &HiddenAccountRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::upsert_hidden_account(&conn, record)
    }

    async fn get_hidden_accounts(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HiddenAccountRecord>> {
        let conn = self.conn.lock().await;
        super::queries::get_hidden_accounts(&conn, from, to)
    }

    async fn get_classifications(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HiddenAccountRecord>> {
        let conn = self.conn.lock().await;
        super::queries::get_classifications(&conn, from, to)
    }

    async fn insert_post_observation(&self, post: &PostEngagement) -> Result<MergeOutcome> {
        let conn = self.conn.lock().await;
        super::queries::insert_post_observation(&conn, post)
    }

    async fn get_posts_created_on(&self, date: NaiveDate) -> Result<Vec<PostEngagement>> {
        let conn = self.conn.lock().await;
        super::queries::get_posts_created_on(&conn, date)
    }

    async fn post_creation_dates(&self) -> Result<Vec<NaiveDate>> {
        let conn = self.conn.lock().await;
        super::queries::post_creation_dates(&conn)
    }

    async fn upsert_rollup(&self, rollup: &DailyEngagementRollup) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::upsert_rollup(&conn, rollup)
    }

    async fn delete_rollup(&self, date: NaiveDate) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::delete_rollup(&conn, date)
    }

    async fn get_rollups(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyEngagementRollup>> {
        let conn = self.conn.lock().await;
        super::queries::get_rollups(&conn, from, to)
    }

    async fn upsert_interactions(&self, rows: &[InteractionRow]) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::upsert_interactions(&conn, rows)
    }

    async fn get_interaction_rows(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<InteractionRow>> {
        let conn = self.conn.lock().await;
        super::queries::get_interaction_rows(&conn, from, to)
    }

    async fn engagement_balance(&self, user_did: &str) -> Result<EngagementBalance> {
        let conn = self.conn.lock().await;
        super::queries::engagement_balance(&conn, user_did)
    }

    async fn merge_archive_batch(&self, run_id: i64, rows: &[ArchiveRow]) -> Result<MergeStats> {
        let conn = self.conn.lock().await;
        super::queries::merge_archive_batch(&conn, run_id, rows)
    }

    async fn insert_backfill_run(
        &self,
        source_archive_hash: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        super::queries::insert_backfill_run(&conn, source_archive_hash, started_at)
    }

    async fn update_backfill_run(&self, run: &BackfillRun) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::update_backfill_run(&conn, run)
    }

    async fn get_backfill_run(&self, id: i64) -> Result<Option<BackfillRun>> {
        let conn = self.conn.lock().await;
        super::queries::get_backfill_run(&conn, id)
    }

    async fn list_backfill_runs(&self) -> Result<Vec<BackfillRun>> {
        let conn = self.conn.lock().await;
        super::queries::list_backfill_runs(&conn)
    }

    async fn find_completed_run(&self, source_archive_hash: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().await;
        super::queries::find_completed_run(&conn, source_archive_hash)
    }

    async fn log_collection(&self, entry: &CollectionLogEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        super::queries::log_collection(&conn, entry)
    }

    async fn has_logged_collection(&self, date: NaiveDate, status: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        super::queries::has_logged_collection(&conn, date, status)
    }

    async fn recent_collections(&self, limit: u32) -> Result<Vec<CollectionLogEntry>> {
        let conn = self.conn.lock().await;
        super::queries::recent_collections(&conn, limit)
    }

    async fn get_non_mutual_following(&self) -> Result<Vec<Member>> {
        let conn = self.conn.lock().await;
        super::queries::get_non_mutual_following(&conn)
    }

    async fn get_followers_only(&self) -> Result<Vec<Member>> {
        let conn = self.conn.lock().await;
        super::queries::get_followers_only(&conn)
    }
}
