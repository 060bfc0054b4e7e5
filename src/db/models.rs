// Data models: Rust structs that map to database rows.
//
// These are the types that flow through the application. They're separate
// from the database queries so other modules can use them without depending
// on rusqlite directly.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};

/// Which relation set a snapshot or event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Followers,
    Following,
    Muted,
    Blocked,
}

impl RelationKind {
    pub const ALL: [RelationKind; 4] = [
        RelationKind::Followers,
        RelationKind::Following,
        RelationKind::Muted,
        RelationKind::Blocked,
    ];

    pub fn parse(s: &str) -> TrackerResult<Self> {
        s.parse()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Followers => "followers",
            RelationKind::Following => "following",
            RelationKind::Muted => "muted",
            RelationKind::Blocked => "blocked",
        }
    }
}

impl std::str::FromStr for RelationKind {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "followers" => Ok(RelationKind::Followers),
            "following" => Ok(RelationKind::Following),
            "muted" => Ok(RelationKind::Muted),
            "blocked" => Ok(RelationKind::Blocked),
            other => Err(TrackerError::Validation(format!(
                "unknown relation kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One account in a relation set. Only `stable_id` (the DID) identifies it;
/// the handle is display data and may change between snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub stable_id: String,
    pub handle: String,
}

impl Member {
    pub fn new(stable_id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            stable_id: stable_id.into(),
            handle: handle.into(),
        }
    }
}

/// One daily capture of a relation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub date: NaiveDate,
    pub kind: RelationKind,
    members: Vec<Member>,
}

impl MemberSnapshot {
    /// Build a snapshot, rejecting duplicate stable ids.
    pub fn new(date: NaiveDate, kind: RelationKind, members: Vec<Member>) -> TrackerResult<Self> {
        let mut seen = HashSet::with_capacity(members.len());
        for m in &members {
            if m.stable_id.is_empty() {
                return Err(TrackerError::Validation(format!(
                    "empty stable_id in {kind} snapshot for {date}"
                )));
            }
            if !seen.insert(m.stable_id.as_str()) {
                return Err(TrackerError::Validation(format!(
                    "duplicate stable_id {} in {kind} snapshot for {date}",
                    m.stable_id
                )));
            }
        }
        Ok(Self {
            date,
            kind,
            members,
        })
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, stable_id: &str) -> bool {
        self.members.iter().any(|m| m.stable_id == stable_id)
    }

    pub fn id_set(&self) -> HashSet<String> {
        self.members.iter().map(|m| m.stable_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Added,
    Removed,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Added => "added",
            Direction::Removed => "removed",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "added" => Ok(Direction::Added),
            "removed" => Ok(Direction::Removed),
            other => Err(TrackerError::Validation(format!("unknown direction: {other}"))),
        }
    }
}

/// Where a change event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Derived by diffing two live snapshots.
    Live,
    /// Derived from a record in an imported repository archive.
    Backfill,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Live => "live",
            EventSource::Backfill => "backfill",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "live" => Ok(EventSource::Live),
            "backfill" => Ok(EventSource::Backfill),
            other => Err(TrackerError::Validation(format!("unknown event source: {other}"))),
        }
    }
}

/// Why a follower disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalCause {
    OrganicUnfollow,
    UserBlocked,
    UserMuted,
    /// Best-effort label: the account vanished from the listing while the
    /// profile count says someone is hidden, and its profile is unreachable.
    SuspectedBlockOrSuspension,
}

impl RemovalCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalCause::OrganicUnfollow => "organic_unfollow",
            RemovalCause::UserBlocked => "user_blocked",
            RemovalCause::UserMuted => "user_muted",
            RemovalCause::SuspectedBlockOrSuspension => "suspected_block_or_suspension",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "organic_unfollow" => Ok(RemovalCause::OrganicUnfollow),
            "user_blocked" => Ok(RemovalCause::UserBlocked),
            "user_muted" => Ok(RemovalCause::UserMuted),
            "suspected_block_or_suspension" => Ok(RemovalCause::SuspectedBlockOrSuspension),
            other => Err(TrackerError::Validation(format!("unknown removal cause: {other}"))),
        }
    }

    pub fn is_hidden(&self) -> bool {
        !matches!(self, RemovalCause::OrganicUnfollow)
    }
}

impl std::fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transition between two adjacent snapshots (or an archive record).
///
/// Identity is `(stable_id, date, kind, direction)`; at most one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub date: NaiveDate,
    pub kind: RelationKind,
    pub direction: Direction,
    pub stable_id: String,
    pub handle: String,
    pub cause: Option<RemovalCause>,
    pub source: EventSource,
}

impl ChangeEvent {
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.stable_id,
            self.date,
            self.kind.as_str(),
            self.direction.as_str()
        )
    }
}

/// Result of a direct profile lookup for a removed account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Found,
    NotFound,
    Suspended,
    Deactivated,
    /// The lookup itself failed (network error, 5xx, ...).
    Error,
    /// No lookup was attempted for this account and date.
    NotChecked,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Found => "found",
            LookupStatus::NotFound => "not_found",
            LookupStatus::Suspended => "suspended",
            LookupStatus::Deactivated => "deactivated",
            LookupStatus::Error => "error",
            LookupStatus::NotChecked => "not_checked",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "found" => Ok(LookupStatus::Found),
            "not_found" => Ok(LookupStatus::NotFound),
            "suspended" => Ok(LookupStatus::Suspended),
            "deactivated" => Ok(LookupStatus::Deactivated),
            "error" => Ok(LookupStatus::Error),
            "not_checked" => Ok(LookupStatus::NotChecked),
            other => Err(TrackerError::Validation(format!("unknown lookup status: {other}"))),
        }
    }

    /// True when the lookup positively failed to reach the profile.
    /// `NotChecked` carries no evidence either way.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            LookupStatus::NotFound
                | LookupStatus::Suspended
                | LookupStatus::Deactivated
                | LookupStatus::Error
        )
    }
}

/// Profile-reported vs API-visible counts for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCounts {
    pub date: NaiveDate,
    pub reported_followers: i64,
    pub reported_following: i64,
    pub api_followers: i64,
    pub api_following: i64,
}

impl DateCounts {
    pub fn hidden_followers(&self) -> i64 {
        self.reported_followers - self.api_followers
    }

    pub fn hidden_following(&self) -> i64 {
        self.reported_following - self.api_following
    }
}

/// Daily counts row with the mute/block breakdown used by the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCountsRow {
    pub counts: DateCounts,
    pub muted_count: i64,
    pub blocked_count: i64,
    /// Hidden followers not explained by mutes or blocks.
    pub suspected_count: i64,
}

/// The raw evidence behind a classification, kept so consumers can
/// re-evaluate the heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEvidence {
    pub reported_count: i64,
    pub api_visible_count: i64,
    pub hidden_count: i64,
    pub in_blocked_set: bool,
    pub in_muted_set: bool,
    pub lookup: LookupStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenAccountRecord {
    pub stable_id: String,
    pub handle: String,
    pub removal_date: NaiveDate,
    pub cause: RemovalCause,
    pub evidence: ClassificationEvidence,
}

/// Engagement counts along each dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementCounts {
    pub likes: u32,
    pub reposts: u32,
    pub replies: u32,
    pub quotes: u32,
    pub bookmarks: u32,
}

impl EngagementCounts {
    pub fn is_zero(&self) -> bool {
        *self == EngagementCounts::default()
    }

    pub fn saturating_add(&self, other: &EngagementCounts) -> EngagementCounts {
        EngagementCounts {
            likes: self.likes.saturating_add(other.likes),
            reposts: self.reposts.saturating_add(other.reposts),
            replies: self.replies.saturating_add(other.replies),
            quotes: self.quotes.saturating_add(other.quotes),
            bookmarks: self.bookmarks.saturating_add(other.bookmarks),
        }
    }
}

/// Metrics for one post as observed on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostEngagement {
    pub post_uri: String,
    pub created_at: DateTime<Utc>,
    /// The collection date for live rows, the creation date for archive rows.
    pub observed_on: NaiveDate,
    pub text: Option<String>,
    pub is_reply: bool,
    /// Parent post URI when this post is a reply.
    pub reply_to_uri: Option<String>,
    pub direct: EngagementCounts,
    /// Engagement on posts quoting this one, attributed back to it.
    pub indirect: EngagementCounts,
    pub source: EventSource,
}

impl PostEngagement {
    pub fn created_on(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEngagementRollup {
    pub date: NaiveDate,
    pub post_count: u32,
    pub posts_with_engagement: u32,
    pub direct: EngagementCounts,
    pub indirect: EngagementCounts,
    pub total_score: f64,
    pub average_score: f64,
    pub best_post_uri: Option<String>,
    pub best_post_score: f64,
}

/// Interactions one account directed at the tracked user on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCounts {
    pub likes: u32,
    pub reposts: u32,
    pub replies: u32,
    pub quotes: u32,
    pub follows: u32,
}

impl InteractionCounts {
    pub fn saturating_add(&self, other: &InteractionCounts) -> InteractionCounts {
        InteractionCounts {
            likes: self.likes.saturating_add(other.likes),
            reposts: self.reposts.saturating_add(other.reposts),
            replies: self.replies.saturating_add(other.replies),
            quotes: self.quotes.saturating_add(other.quotes),
            follows: self.follows.saturating_add(other.follows),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionScore {
    pub stable_id: String,
    pub handle: String,
    pub counts: InteractionCounts,
    pub score: u64,
    pub last_interaction: Option<DateTime<Utc>>,
}

/// Raw per-day interaction row as written by the collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRow {
    pub stable_id: String,
    pub handle: String,
    pub date: NaiveDate,
    pub counts: InteractionCounts,
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GivenKind {
    Like,
    Repost,
}

impl GivenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GivenKind::Like => "like",
            GivenKind::Repost => "repost",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "like" => Ok(GivenKind::Like),
            "repost" => Ok(GivenKind::Repost),
            other => Err(TrackerError::Validation(format!("unknown given kind: {other}"))),
        }
    }
}

/// A like or repost the tracked user gave, recovered from the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GivenEngagement {
    /// AT-URI of the like/repost record itself (dedup key).
    pub record_uri: String,
    pub kind: GivenKind,
    pub subject_uri: String,
    pub subject_author_did: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outgoing engagement summary (likes, reposts, replies to others).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementBalance {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Cancelled,
    Failed,
    /// The archive hash already has a completed run; nothing was merged.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> TrackerResult<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "cancelled" => Ok(RunStatus::Cancelled),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(TrackerError::Validation(format!("unknown run status: {other}"))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record for one archive import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRun {
    pub id: i64,
    pub source_archive_hash: String,
    pub repo_did: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub blocks_read: u64,
    pub records_seen: u64,
    pub rows_merged: u64,
    pub duplicates_skipped: u64,
    pub merge_conflicts: u64,
    pub unrecoverable_records: u64,
    pub error: Option<String>,
}

/// One row produced from an archive record, ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveRow {
    Event(ChangeEvent),
    Post(PostEngagement),
    Given(GivenEngagement),
}

impl ArchiveRow {
    /// The calendar date this row lands on.
    pub fn date(&self) -> NaiveDate {
        match self {
            ArchiveRow::Event(e) => e.date,
            ArchiveRow::Post(p) => p.created_on(),
            ArchiveRow::Given(g) => g.created_at.date_naive(),
        }
    }

    pub fn dedup_key(&self) -> String {
        match self {
            ArchiveRow::Event(e) => e.dedup_key(),
            ArchiveRow::Post(p) => format!("{}|{}", p.post_uri, p.observed_on),
            ArchiveRow::Given(g) => g.record_uri.clone(),
        }
    }
}

/// Counters from merging one batch of archive rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: u64,
    pub duplicates: u64,
    /// Dedup keys whose stored payload differed; the stored row was kept.
    pub conflicts: Vec<String>,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.conflicts.extend(other.conflicts);
    }
}

/// Outcome of one collection cycle, written to the collection log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionLogEntry {
    pub collection_date: NaiveDate,
    pub status: String,
    pub followers_collected: Option<i64>,
    pub following_collected: Option<i64>,
    pub error: Option<String>,
    pub duration_secs: f64,
}

/// New/lost members per date, derived from change events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerVelocity {
    pub date: NaiveDate,
    pub new_followers: i64,
    pub lost_followers: i64,
    pub new_following: i64,
    pub lost_following: i64,
}

impl FollowerVelocity {
    pub fn net_followers(&self) -> i64 {
        self.new_followers - self.lost_followers
    }

    pub fn net_following(&self) -> i64 {
        self.new_following - self.lost_following
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_snapshot_rejects_duplicate_ids() {
        let err = MemberSnapshot::new(
            day(1),
            RelationKind::Followers,
            vec![Member::new("did:plc:a", "a.bsky.social"), Member::new("did:plc:a", "renamed.bsky.social")],
        )
        .unwrap_err();
        assert!(matches!(err, TrackerError::Validation(_)));
    }

    #[test]
    fn test_snapshot_rejects_empty_id() {
        let err = MemberSnapshot::new(day(1), RelationKind::Muted, vec![Member::new("", "x")])
            .unwrap_err();
        assert!(matches!(err, TrackerError::Validation(_)));
    }

    #[test]
    fn test_relation_kind_roundtrip() {
        for kind in RelationKind::ALL {
            assert_eq!(kind.as_str().parse::<RelationKind>().unwrap(), kind);
        }
        assert!("friends".parse::<RelationKind>().is_err());
    }

    #[test]
    fn test_lookup_not_checked_is_not_evidence() {
        assert!(!LookupStatus::NotChecked.is_unreachable());
        assert!(!LookupStatus::Found.is_unreachable());
        assert!(LookupStatus::Suspended.is_unreachable());
        assert!(LookupStatus::Error.is_unreachable());
    }

    #[test]
    fn test_hidden_counts() {
        let counts = DateCounts {
            date: day(2),
            reported_followers: 105,
            reported_following: 40,
            api_followers: 100,
            api_following: 41,
        };
        assert_eq!(counts.hidden_followers(), 5);
        assert_eq!(counts.hidden_following(), -1);
    }
}
