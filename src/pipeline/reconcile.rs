// Re-derivation of everything computed from stored facts.
//
// Live events, classifications and rollups are all functions of snapshots,
// counts, lookups and post observations. When any of those change for a
// date (a new snapshot, an archive merge) the derived rows for that date are
// rebuilt here from scratch.

use std::collections::{BTreeSet, HashSet};

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::db::models::{ChangeEvent, HiddenAccountRecord, RelationKind};
use crate::db::Database;
use crate::engagement::rollup::refresh_rollup;
use crate::error::TrackerError;
use crate::tracking::{classify, diff};

/// What a reconcile pass rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub live_events: usize,
    pub classified: usize,
    pub rollups: usize,
    /// Dates whose removals could not be classified (no counts recorded).
    pub skipped_dates: Vec<NaiveDate>,
}

/// Re-diff the snapshot for (date, kind) against the one before it and
/// replace the stored live events. Returns `None` when there is no
/// snapshot on that date.
pub async fn rediff(
    db: &dyn Database,
    date: NaiveDate,
    kind: RelationKind,
) -> Result<Option<Vec<ChangeEvent>>> {
    let Some(current) = db.get_snapshot(date, kind).await? else {
        return Ok(None);
    };
    let previous = match db.previous_snapshot_date(date, kind).await? {
        Some(prev_date) => db.get_snapshot(prev_date, kind).await?,
        None => None,
    };

    let events = diff(previous.as_ref(), &current)?;
    db.replace_live_events(date, kind, &events).await?;
    debug!(%date, %kind, events = events.len(), "Snapshot re-diffed");
    Ok(Some(events))
}

/// Blocked accounts as of `date`: that day's blocked snapshot plus any
/// archive block records created on or before it.
pub async fn blocked_set(db: &dyn Database, date: NaiveDate) -> Result<HashSet<String>> {
    let mut blocked = db.archive_blocked_as_of(date).await?;
    if let Some(snapshot) = db.get_snapshot(date, RelationKind::Blocked).await? {
        blocked.extend(snapshot.id_set());
    }
    Ok(blocked)
}

async fn muted_set(db: &dyn Database, date: NaiveDate) -> Result<HashSet<String>> {
    Ok(db
        .get_snapshot(date, RelationKind::Muted)
        .await?
        .map(|s| s.id_set())
        .unwrap_or_default())
}

/// Classify every removed follower on `date` and store the result.
///
/// Fails with `InconsistentState` when there are removals but no counts
/// were recorded for the date.
pub async fn classify_removals(db: &dyn Database, date: NaiveDate) -> Result<Vec<HiddenAccountRecord>> {
    let removed = db.get_removed_followers(date).await?;
    if removed.is_empty() {
        return Ok(Vec::new());
    }

    let counts = db.get_date_counts(date).await?.ok_or_else(|| {
        TrackerError::InconsistentState(format!(
            "{} removed followers on {date} but no counts recorded",
            removed.len()
        ))
    })?;
    let muted = muted_set(db, date).await?;
    let blocked = blocked_set(db, date).await?;

    let mut records = Vec::with_capacity(removed.len());
    for event in &removed {
        let lookup = db.get_profile_lookup(&event.stable_id, date).await?;
        let record = classify(event, &counts, &muted, &blocked, lookup)?;
        db.upsert_hidden_account(&record).await?;
        records.push(record);
    }

    debug!(%date, removed = records.len(), "Removals classified");
    Ok(records)
}

/// Rebuild derived state for every date in `dates`.
///
/// Classification is redone from the earliest date onward, since an archive
/// block on day D affects every later removal.
pub async fn reconcile_dates(db: &dyn Database, dates: &BTreeSet<NaiveDate>) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let Some(&earliest) = dates.iter().next() else {
        return Ok(summary);
    };

    for &date in dates {
        for kind in RelationKind::ALL {
            if let Some(events) = rediff(db, date, kind).await? {
                summary.live_events += events.len();
            }
        }
    }

    for date in db.removal_dates_since(earliest).await? {
        match classify_removals(db, date).await {
            Ok(records) => summary.classified += records.len(),
            Err(e) if matches!(e.downcast_ref::<TrackerError>(), Some(TrackerError::InconsistentState(_))) => {
                warn!(%date, error = %e, "Skipping classification");
                summary.skipped_dates.push(date);
            }
            Err(e) => return Err(e),
        }
    }

    for &date in dates {
        if refresh_rollup(db, date).await?.is_some() {
            summary.rollups += 1;
        }
    }

    info!(
        dates = dates.len(),
        live_events = summary.live_events,
        classified = summary.classified,
        rollups = summary.rollups,
        "Derived state reconciled"
    );
    Ok(summary)
}

/// Rebuild derived state for every date that has a snapshot or a post.
pub async fn rebuild_all(db: &dyn Database) -> Result<ReconcileSummary> {
    let mut dates: BTreeSet<NaiveDate> = db.post_creation_dates().await?.into_iter().collect();
    for kind in RelationKind::ALL {
        dates.extend(db.snapshot_dates(kind).await?);
    }
    reconcile_dates(db, &dates).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::models::{
        ChangeEvent, DateCounts, Direction, EventSource, LookupStatus, Member, MemberSnapshot,
        RemovalCause,
    };

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn snapshot(d: u32, kind: RelationKind, ids: &[&str]) -> MemberSnapshot {
        let members = ids.iter().map(|id| Member::new(*id, format!("{id}.test"))).collect();
        MemberSnapshot::new(day(d), kind, members).unwrap()
    }

    fn counts(d: u32, reported: i64, api: i64) -> DateCounts {
        DateCounts {
            date: day(d),
            reported_followers: reported,
            reported_following: 0,
            api_followers: api,
            api_following: 0,
        }
    }

    #[tokio::test]
    async fn test_rediff_without_snapshot() {
        let db = db::in_memory().unwrap();
        assert!(rediff(db.as_ref(), day(1), RelationKind::Followers)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rediff_and_classify() {
        let db = db::in_memory().unwrap();
        db.insert_snapshot(&snapshot(1, RelationKind::Followers, &["did:a", "did:b", "did:c"]))
            .await
            .unwrap();
        db.insert_snapshot(&snapshot(2, RelationKind::Followers, &["did:a"]))
            .await
            .unwrap();
        db.insert_snapshot(&snapshot(2, RelationKind::Blocked, &["did:b"]))
            .await
            .unwrap();
        db.upsert_daily_counts(&counts(2, 3, 1), 0, 1).await.unwrap();
        db.upsert_profile_lookup("did:c", day(2), LookupStatus::Suspended)
            .await
            .unwrap();

        let events = rediff(db.as_ref(), day(2), RelationKind::Followers)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 2);

        let records = classify_removals(db.as_ref(), day(2)).await.unwrap();
        let causes: Vec<_> = records.iter().map(|r| (r.stable_id.as_str(), r.cause)).collect();
        assert_eq!(
            causes,
            vec![
                ("did:b", RemovalCause::UserBlocked),
                ("did:c", RemovalCause::SuspectedBlockOrSuspension),
            ]
        );
    }

    #[tokio::test]
    async fn test_archive_block_reclassifies_earlier_removal() {
        let db = db::in_memory().unwrap();
        db.insert_snapshot(&snapshot(1, RelationKind::Followers, &["did:a", "did:b"]))
            .await
            .unwrap();
        db.insert_snapshot(&snapshot(3, RelationKind::Followers, &["did:a"]))
            .await
            .unwrap();
        db.upsert_daily_counts(&counts(3, 1, 1), 0, 0).await.unwrap();

        rediff(db.as_ref(), day(3), RelationKind::Followers).await.unwrap();
        let before = classify_removals(db.as_ref(), day(3)).await.unwrap();
        assert_eq!(before[0].cause, RemovalCause::OrganicUnfollow);

        let block = ChangeEvent {
            date: day(2),
            kind: RelationKind::Blocked,
            direction: Direction::Added,
            stable_id: "did:b".to_string(),
            handle: "did:b".to_string(),
            cause: None,
            source: EventSource::Backfill,
        };
        db.merge_archive_batch(1, &[crate::db::models::ArchiveRow::Event(block)])
            .await
            .unwrap();

        let summary = reconcile_dates(db.as_ref(), &BTreeSet::from([day(2)]))
            .await
            .unwrap();
        assert_eq!(summary.classified, 1);
        let after = db.get_classifications(day(1), day(5)).await.unwrap();
        assert_eq!(after[0].cause, RemovalCause::UserBlocked);
    }

    #[tokio::test]
    async fn test_missing_counts_skipped() {
        let db = db::in_memory().unwrap();
        db.insert_snapshot(&snapshot(1, RelationKind::Followers, &["did:a"]))
            .await
            .unwrap();
        db.insert_snapshot(&snapshot(2, RelationKind::Followers, &[]))
            .await
            .unwrap();

        let err = {
            rediff(db.as_ref(), day(2), RelationKind::Followers).await.unwrap();
            classify_removals(db.as_ref(), day(2)).await.unwrap_err()
        };
        assert!(matches!(
            err.downcast_ref::<TrackerError>(),
            Some(TrackerError::InconsistentState(_))
        ));

        let summary = reconcile_dates(db.as_ref(), &BTreeSet::from([day(2)]))
            .await
            .unwrap();
        assert_eq!(summary.skipped_dates, vec![day(2)]);
    }

    #[tokio::test]
    async fn test_rebuild_all_covers_every_snapshot_date() {
        let db = db::in_memory().unwrap();
        db.insert_snapshot(&snapshot(1, RelationKind::Followers, &["did:a", "did:b"]))
            .await
            .unwrap();
        db.insert_snapshot(&snapshot(2, RelationKind::Followers, &["did:a"]))
            .await
            .unwrap();
        db.upsert_daily_counts(&counts(2, 1, 1), 0, 0).await.unwrap();

        let summary = rebuild_all(db.as_ref()).await.unwrap();
        assert_eq!(summary.live_events, 1);
        assert_eq!(summary.classified, 1);
        assert!(summary.skipped_dates.is_empty());

        let events = db.get_changes_since(day(1), None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stable_id, "did:b");
    }
}
