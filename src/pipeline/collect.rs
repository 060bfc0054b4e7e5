// Daily collection cycle.
//
// Steps, in order:
//   1. Resolve the tracked account and read its self-reported counts
//   2. Fetch all four relation lists, recent posts (plus quotes) and
//      received interactions
//   3. Store the day's snapshots and counts, then diff each list against
//      the previous day
//   4. Look up every removed follower and classify the removals
//   5. Store post observations and rebuild rollups for their dates
//   6. Store received interactions
//
// Nothing is written until every fetch has succeeded. A cycle holds the
// collection slot and the exclusive append lock for its whole run. A day
// with a successful cycle in the log is skipped; any other day is
// (re)collected.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use super::reconcile::{classify_removals, rediff};
use super::retry::{with_retry, RetryPolicy};
use crate::bluesky::posts::FetchedPost;
use crate::bluesky::GraphSource;
use crate::context::AppContext;
use crate::db::models::{
    CollectionLogEntry, DateCounts, Direction, EventSource, Member, MemberSnapshot, PostEngagement,
    RelationKind,
};
use crate::db::queries::MergeOutcome;
use crate::db::Database;
use crate::engagement::rollup::refresh_rollup;
use crate::engagement::score::indirect_from_quotes;
use crate::error::TrackerError;

/// Concurrent profile lookups / quote fetches per cycle.
const FETCH_CONCURRENCY: usize = 5;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_SKIPPED: &str = "skipped";

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub date: Option<NaiveDate>,
    pub status: String,
    pub followers: usize,
    pub following: usize,
    pub muted: usize,
    pub blocked: usize,
    pub events: usize,
    pub classified: usize,
    pub posts_observed: usize,
    pub rollups: usize,
    pub interactions: usize,
    pub duration_secs: f64,
}

impl CycleReport {
    fn log_entry(&self, date: NaiveDate, error: Option<String>) -> CollectionLogEntry {
        let collected = |n: usize| (self.status == STATUS_SUCCESS).then_some(n as i64);
        CollectionLogEntry {
            collection_date: date,
            status: self.status.clone(),
            followers_collected: collected(self.followers),
            following_collected: collected(self.following),
            error,
            duration_secs: self.duration_secs,
        }
    }
}

/// Run one collection cycle for `date`.
///
/// Fails immediately with `AlreadyRunning` if another cycle holds the
/// collection slot. Failed cycles are written to the collection log
/// before the error is returned.
pub async fn run_cycle(ctx: &AppContext, source: &dyn GraphSource, date: NaiveDate) -> Result<CycleReport> {
    let _slot = ctx.locks.try_collection()?;
    let db = ctx.db.as_ref();
    let started = Instant::now();

    if db.has_logged_collection(date, STATUS_SUCCESS).await? {
        info!(%date, "Already collected today, skipping");
        let report = CycleReport {
            date: Some(date),
            status: STATUS_SKIPPED.to_string(),
            duration_secs: started.elapsed().as_secs_f64(),
            ..Default::default()
        };
        db.log_collection(&report.log_entry(date, None)).await?;
        return Ok(report);
    }

    let _append = ctx.locks.append_exclusive().await;
    info!(%date, handle = %ctx.config.bluesky_handle, "Collection cycle starting");

    let mut report = CycleReport {
        date: Some(date),
        ..Default::default()
    };
    let outcome = collect(ctx, source, date, &mut report).await;
    report.duration_secs = started.elapsed().as_secs_f64();

    match outcome {
        Ok(()) => {
            report.status = STATUS_SUCCESS.to_string();
            db.log_collection(&report.log_entry(date, None)).await?;
            db.set_scan_state("last_collection_at", &Utc::now().to_rfc3339())
                .await?;
            info!(
                %date,
                followers = report.followers,
                following = report.following,
                events = report.events,
                classified = report.classified,
                posts = report.posts_observed,
                duration_secs = report.duration_secs,
                "Collection cycle finished"
            );
            Ok(report)
        }
        Err(e) => {
            report.status = STATUS_FAILED.to_string();
            if let Err(log_err) = db.log_collection(&report.log_entry(date, Some(format!("{e:#}")))).await {
                warn!(error = %log_err, "Could not write collection log");
            }
            Err(e)
        }
    }
}

async fn collect(
    ctx: &AppContext,
    source: &dyn GraphSource,
    date: NaiveDate,
    report: &mut CycleReport,
) -> Result<()> {
    let db = ctx.db.as_ref();
    let policy = RetryPolicy::new(ctx.config.fetch_attempts);
    let handle = ctx.config.bluesky_handle.as_str();

    // Steps 1-2: every remote read happens before anything is written
    let did = with_retry(policy, "resolve handle", move || source.resolve_did(handle)).await?;
    let did = did.as_str();
    let profile = with_retry(policy, "profile counts", move || source.fetch_profile_counts(did)).await?;

    let mut snapshots = Vec::with_capacity(RelationKind::ALL.len());
    for kind in RelationKind::ALL {
        let members = fetch_all_members(source, policy, did, kind).await?;
        snapshots.push(MemberSnapshot::new(date, kind, members)?);
    }

    let recent_posts = ctx.config.recent_posts;
    let posts = with_retry(policy, "recent posts", move || source.fetch_recent_posts(did, recent_posts)).await?;
    let observations = observe_posts(source, policy, date, posts).await;
    let interactions = with_retry(policy, "interactions", move || source.fetch_interactions(did, date)).await?;

    // Step 3: snapshots, counts, then diffs
    db.set_scan_state("tracked_did", did).await?;
    for snapshot in &snapshots {
        let n = store_snapshot(db, snapshot).await?;
        match snapshot.kind {
            RelationKind::Followers => report.followers = n,
            RelationKind::Following => report.following = n,
            RelationKind::Muted => report.muted = n,
            RelationKind::Blocked => report.blocked = n,
        }
    }

    let counts = DateCounts {
        date,
        reported_followers: profile.followers,
        reported_following: profile.following,
        api_followers: report.followers as i64,
        api_following: report.following as i64,
    };
    db.upsert_daily_counts(&counts, report.muted as i64, report.blocked as i64)
        .await?;

    let mut removed_followers = Vec::new();
    for kind in RelationKind::ALL {
        let events = rediff(db, date, kind).await?.unwrap_or_default();
        report.events += events.len();
        removed_followers.extend(
            events
                .into_iter()
                .filter(|e| e.kind == RelationKind::Followers && e.direction == Direction::Removed)
                .map(|e| e.stable_id),
        );
    }

    // Step 4: lookups and classification. A failed lookup comes back as a
    // status, never an error.
    let lookups: Vec<_> = stream::iter(removed_followers)
        .map(|stable_id| async move {
            let status = source.lookup_profile(&stable_id).await;
            (stable_id, status)
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await;
    for (stable_id, status) in &lookups {
        db.upsert_profile_lookup(stable_id, date, *status).await?;
    }
    report.classified = classify_removals(db, date).await?.len();

    // Step 5: engagement
    let mut post_dates = BTreeSet::new();
    for post in &observations {
        match db.insert_post_observation(post).await? {
            MergeOutcome::Inserted => report.posts_observed += 1,
            MergeOutcome::Duplicate => {}
            MergeOutcome::Conflict => {
                let err = TrackerError::MergeConflict {
                    key: format!("{}|{}", post.post_uri, post.observed_on),
                };
                warn!(error = %err, "Post observation disagrees with stored row");
            }
        }
        post_dates.insert(post.created_on());
    }
    for post_date in post_dates {
        if refresh_rollup(db, post_date).await?.is_some() {
            report.rollups += 1;
        }
    }

    // Step 6: interactions
    db.upsert_interactions(&interactions).await?;
    report.interactions = interactions.len();

    Ok(())
}

/// Store the day's snapshot unless an earlier, interrupted cycle already
/// captured one. Snapshots are immutable, so the stored one is kept and its
/// size reported.
async fn store_snapshot(db: &dyn Database, snapshot: &MemberSnapshot) -> Result<usize> {
    if let Some(stored) = db.get_snapshot(snapshot.date, snapshot.kind).await? {
        info!(
            date = %snapshot.date,
            kind = %snapshot.kind,
            stored = stored.len(),
            fetched = snapshot.len(),
            "Snapshot already captured by an interrupted cycle, keeping it"
        );
        return Ok(stored.len());
    }
    db.insert_snapshot(snapshot).await?;
    Ok(snapshot.len())
}

/// Walk every page of a listing. Accounts repeated across pages are kept
/// once (first occurrence wins).
async fn fetch_all_members(
    source: &dyn GraphSource,
    policy: RetryPolicy,
    did: &str,
    kind: RelationKind,
) -> Result<Vec<Member>> {
    let mut members = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;
    let what = format!("{kind} page");

    loop {
        let cur = cursor.as_deref();
        let page = with_retry(policy, &what, move || source.fetch_member_page(did, kind, cur)).await?;
        let page_len = page.members.len();

        for member in page.members {
            if seen.insert(member.stable_id.clone()) {
                members.push(member);
            } else {
                debug!(%kind, stable_id = %member.stable_id, "Duplicate across pages");
            }
        }

        match page.cursor {
            Some(next) if page_len > 0 && cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }

    info!(%kind, count = members.len(), "Collected relation list");
    Ok(members)
}

/// Turn fetched posts into today's observations, attaching the engagement
/// of posts that quote them. A failed quote fetch leaves indirect at zero.
async fn observe_posts(
    source: &dyn GraphSource,
    policy: RetryPolicy,
    date: NaiveDate,
    posts: Vec<FetchedPost>,
) -> Vec<PostEngagement> {
    stream::iter(posts)
        .map(|post| async move {
            let quoting = if post.counts.quotes > 0 {
                let uri = post.uri.as_str();
                match with_retry(policy, "quotes", move || source.fetch_quoting_posts(uri)).await {
                    Ok(quotes) => quotes.iter().map(|q| q.counts).collect(),
                    Err(e) => {
                        warn!(uri = %post.uri, error = %e, "Quotes unavailable, indirect engagement skipped");
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            PostEngagement {
                is_reply: post.reply_to_uri.is_some(),
                indirect: indirect_from_quotes(&quoting),
                post_uri: post.uri,
                created_at: post.created_at,
                observed_on: date,
                text: Some(post.text),
                reply_to_uri: post.reply_to_uri,
                direct: post.counts,
                source: EventSource::Live,
            }
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect()
        .await
}

/// Run a cycle every `interval`, forever. Failures are logged and the next
/// cycle starts on schedule.
pub async fn watch(ctx: &AppContext, source: &dyn GraphSource, interval: Duration) -> Result<()> {
    loop {
        let today = Utc::now().date_naive();
        match run_cycle(ctx, source, today).await {
            Ok(report) => debug!(status = %report.status, "Cycle complete"),
            Err(e) => match e.downcast_ref::<TrackerError>() {
                Some(TrackerError::AlreadyRunning(what)) => {
                    warn!(what = *what, "Previous cycle still running, skipping")
                }
                _ => error!(error = %format!("{e:#}"), "Collection cycle failed"),
            },
        }
        info!(hours = interval.as_secs() / 3600, "Sleeping until next cycle");
        tokio::time::sleep(interval).await;
    }
}
