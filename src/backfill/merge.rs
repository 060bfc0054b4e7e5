// Projection of archive records into the rows live collection produces.
//
// Every row carries the record's own timestamp, never the import's wall
// clock, so an archive follow from 2023 lands on its 2023 date.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::warn;

use crate::archive::records::{self, ArchiveRecord};
use crate::db::models::{
    ArchiveRow, ChangeEvent, Direction, EngagementCounts, EventSource, GivenEngagement, GivenKind,
    MergeStats, PostEngagement, RelationKind,
};
use crate::error::TrackerError;

/// Turn one record into a mergeable row for the repository owner `repo_did`.
pub fn project(record: &ArchiveRecord, repo_did: &str) -> ArchiveRow {
    match record {
        ArchiveRecord::Follow {
            subject,
            created_at,
            ..
        } => ArchiveRow::Event(archive_event(RelationKind::Following, subject, created_at.date_naive())),
        ArchiveRecord::Block {
            subject,
            created_at,
            ..
        } => ArchiveRow::Event(archive_event(RelationKind::Blocked, subject, created_at.date_naive())),
        ArchiveRecord::Post {
            rkey,
            text,
            created_at,
            reply_parent,
        } => ArchiveRow::Post(PostEngagement {
            post_uri: format!("at://{repo_did}/{}/{rkey}", records::POST),
            created_at: *created_at,
            observed_on: created_at.date_naive(),
            text: Some(text.clone()),
            is_reply: reply_parent.is_some(),
            reply_to_uri: reply_parent.clone(),
            direct: EngagementCounts::default(),
            indirect: EngagementCounts::default(),
            source: EventSource::Backfill,
        }),
        ArchiveRecord::Like {
            rkey,
            subject_uri,
            created_at,
        } => ArchiveRow::Given(given(repo_did, records::LIKE, rkey, GivenKind::Like, subject_uri, created_at)),
        ArchiveRecord::Repost {
            rkey,
            subject_uri,
            created_at,
        } => ArchiveRow::Given(given(
            repo_did,
            records::REPOST,
            rkey,
            GivenKind::Repost,
            subject_uri,
            created_at,
        )),
    }
}

fn archive_event(kind: RelationKind, subject: &str, date: NaiveDate) -> ChangeEvent {
    ChangeEvent {
        date,
        kind,
        direction: Direction::Added,
        stable_id: subject.to_string(),
        // Archives hold DIDs only; the handle is filled in by later live data
        handle: subject.to_string(),
        cause: None,
        source: EventSource::Backfill,
    }
}

fn given(
    repo_did: &str,
    collection: &str,
    rkey: &str,
    kind: GivenKind,
    subject_uri: &str,
    created_at: &chrono::DateTime<chrono::Utc>,
) -> GivenEngagement {
    GivenEngagement {
        record_uri: format!("at://{repo_did}/{collection}/{rkey}"),
        kind,
        subject_uri: subject_uri.to_string(),
        subject_author_did: records::uri_authority(subject_uri).map(str::to_string),
        created_at: *created_at,
    }
}

/// Dates touched by a set of rows, for re-derivation after the merge.
pub fn affected_dates(rows: &[ArchiveRow]) -> BTreeSet<NaiveDate> {
    rows.iter().map(ArchiveRow::date).collect()
}

/// Log each dedup-key collision. The stored row has already won.
pub fn report_conflicts(run_id: i64, stats: &MergeStats) {
    for key in &stats.conflicts {
        let err = TrackerError::MergeConflict { key: key.clone() };
        warn!(run_id, error = %err, "Archive row disagrees with stored row");
    }
}
