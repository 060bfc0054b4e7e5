// Collection cycles against an in-memory graph source.

mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use tidemark::bluesky::posts::FetchedPost;
use tidemark::db::models::{
    Direction, EngagementCounts, InteractionCounts, InteractionRow, LookupStatus, Member,
    MemberSnapshot, RelationKind, RemovalCause,
};
use tidemark::error::TrackerError;
use tidemark::pipeline::collect::{self, STATUS_FAILED, STATUS_SKIPPED, STATUS_SUCCESS};

use support::{day, noon, test_ctx, FakeSource, ME};

fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

fn source_with_followers(ids: &[&str]) -> FakeSource {
    let source = FakeSource::default();
    source.set_counts(ids.len() as i64, 0);
    source.set_list(RelationKind::Followers, ids);
    source
}

// ============================================================
// Cycle bookkeeping
// ============================================================

#[tokio::test]
async fn test_cycle_stores_snapshots_and_skips_rerun() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a", "did:plc:b", "did:plc:c"]);
    source.set_list(RelationKind::Following, &["did:plc:a", "did:plc:x"]);

    let report = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(report.status, STATUS_SUCCESS);
    assert_eq!(report.followers, 3);
    assert_eq!(report.following, 2);
    assert_eq!(report.events, 0);

    let snapshot = ctx
        .db
        .get_snapshot(day(1), RelationKind::Followers)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(
        ctx.db.get_scan_state("tracked_did").await.unwrap().as_deref(),
        Some(ME)
    );

    let rerun = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(rerun.status, STATUS_SKIPPED);

    let log = ctx.db.recent_collections(5).await.unwrap();
    let statuses: Vec<&str> = log.iter().map(|e| e.status.as_str()).collect();
    assert!(statuses.contains(&STATUS_SUCCESS));
    assert!(statuses.contains(&STATUS_SKIPPED));
}

#[tokio::test]
async fn test_cycle_rejected_while_another_runs() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a"]);

    let _held = ctx.locks.try_collection().unwrap();
    let err = collect::run_cycle(&ctx, &source, day(1)).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrackerError>(),
        Some(TrackerError::AlreadyRunning("collection"))
    ));
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a"]);
    source.failures.store(1, Ordering::SeqCst);

    let report = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(report.status, STATUS_SUCCESS);
}

#[tokio::test]
async fn test_exhausted_retries_fail_cycle_and_log_it() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a"]);
    source.failures.store(10, Ordering::SeqCst);

    assert!(collect::run_cycle(&ctx, &source, day(1)).await.is_err());

    let log = ctx.db.recent_collections(1).await.unwrap();
    assert_eq!(log[0].status, STATUS_FAILED);
    assert!(log[0].error.as_deref().unwrap().contains("simulated 503"));
    assert_eq!(log[0].followers_collected, None);

    // Nothing was written for the day, so a later cycle can still run it
    assert!(ctx
        .db
        .get_snapshot(day(1), RelationKind::Followers)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_cycle_is_retried_the_same_day() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a", "did:plc:b"]);
    let post = format!("at://{ME}/app.bsky.feed.post/first");
    source.state.lock().unwrap().posts = vec![fetched(
        &post,
        1,
        EngagementCounts {
            likes: 5,
            ..Default::default()
        },
    )];
    // Both attempts at the post listing fail, after the lists were fetched
    source.post_failures.store(2, Ordering::SeqCst);

    let err = collect::run_cycle(&ctx, &source, day(1)).await.unwrap_err();
    assert!(format!("{err:#}").contains("simulated timeout"));
    assert!(ctx
        .db
        .get_snapshot(day(1), RelationKind::Followers)
        .await
        .unwrap()
        .is_none());

    let retry = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(retry.status, STATUS_SUCCESS);
    assert_eq!(retry.followers, 2);
    assert_eq!(retry.posts_observed, 1);
    assert_eq!(retry.rollups, 1);

    let posts = ctx.db.get_posts_created_on(day(1)).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].direct.likes, 5);
    assert_eq!(ctx.db.get_rollups(day(1), day(1)).await.unwrap().len(), 1);

    let again = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(again.status, STATUS_SKIPPED);

    let log = ctx.db.recent_collections(5).await.unwrap();
    let statuses: Vec<&str> = log.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(statuses, vec![STATUS_SKIPPED, STATUS_SUCCESS, STATUS_FAILED]);
}

#[tokio::test]
async fn test_interrupted_cycle_keeps_stored_snapshot() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a", "did:plc:b", "did:plc:c"]);

    // A cycle that died mid-write left the followers list behind
    let stored = MemberSnapshot::new(
        day(1),
        RelationKind::Followers,
        vec![Member::new("did:plc:a", "a.handle")],
    )
    .unwrap();
    ctx.db.insert_snapshot(&stored).await.unwrap();

    let report = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(report.status, STATUS_SUCCESS);
    assert_eq!(report.followers, 1);

    let following = ctx
        .db
        .get_snapshot(day(1), RelationKind::Following)
        .await
        .unwrap();
    assert!(following.is_some_and(|s| s.is_empty()));
}

#[tokio::test]
async fn test_members_repeated_across_pages_kept_once() {
    let ctx = test_ctx(50);
    // Pages of two: [a, b], [b, c], [d]
    let source = source_with_followers(&["did:plc:a", "did:plc:b", "did:plc:b", "did:plc:c", "did:plc:d"]);

    let report = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(report.followers, 4);
}

// ============================================================
// Diffs and classification
// ============================================================

#[tokio::test]
async fn test_removed_followers_are_classified() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a", "did:plc:b", "did:plc:c", "did:plc:d"]);
    collect::run_cycle(&ctx, &source, day(1)).await.unwrap();

    // b was blocked by the user, c vanished and can't be looked up, d unfollowed
    source.set_list(RelationKind::Followers, &["did:plc:a", "did:plc:e"]);
    source.set_list(RelationKind::Blocked, &["did:plc:b"]);
    source.set_counts(4, 0);
    source.state.lock().unwrap().lookups = HashMap::from([
        ("did:plc:c".to_string(), LookupStatus::Suspended),
        ("did:plc:d".to_string(), LookupStatus::Found),
    ]);

    let report = collect::run_cycle(&ctx, &source, day(2)).await.unwrap();
    assert_eq!(report.classified, 3);

    let changes = ctx
        .db
        .get_changes_since(day(2), Some(RelationKind::Followers))
        .await
        .unwrap();
    let added: Vec<&str> = changes
        .iter()
        .filter(|e| e.direction == Direction::Added)
        .map(|e| e.stable_id.as_str())
        .collect();
    assert_eq!(added, vec!["did:plc:e"]);

    let all = ctx.db.get_classifications(day(2), day(2)).await.unwrap();
    let cause_of = |id: &str| all.iter().find(|r| r.stable_id == id).map(|r| r.cause);
    assert_eq!(cause_of("did:plc:b"), Some(RemovalCause::UserBlocked));
    assert_eq!(cause_of("did:plc:c"), Some(RemovalCause::SuspectedBlockOrSuspension));
    assert_eq!(cause_of("did:plc:d"), Some(RemovalCause::OrganicUnfollow));

    let hidden = ctx.db.get_hidden_accounts(day(2), day(2)).await.unwrap();
    assert_eq!(hidden.len(), 2);
    assert!(hidden.iter().all(|r| r.cause != RemovalCause::OrganicUnfollow));

    let suspected = hidden.iter().find(|r| r.stable_id == "did:plc:c").unwrap();
    assert_eq!(suspected.evidence.hidden_count, 2);
    assert_eq!(suspected.evidence.lookup, LookupStatus::Suspended);
}

#[tokio::test]
async fn test_unchanged_lists_produce_no_events() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a", "did:plc:b"]);
    collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    let report = collect::run_cycle(&ctx, &source, day(2)).await.unwrap();

    assert_eq!(report.events, 0);
    assert!(ctx.db.get_changes_since(day(1), None).await.unwrap().is_empty());
}

// ============================================================
// Engagement
// ============================================================

fn fetched(uri: &str, created: u32, counts: EngagementCounts) -> FetchedPost {
    FetchedPost {
        uri: uri.to_string(),
        author_did: ME.to_string(),
        text: "hello".to_string(),
        created_at: at(&noon(created)),
        reply_to_uri: None,
        counts,
    }
}

#[tokio::test]
async fn test_quotes_feed_indirect_engagement() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a"]);
    let original = format!("at://{ME}/app.bsky.feed.post/orig");
    {
        let mut state = source.state.lock().unwrap();
        state.posts = vec![fetched(
            &original,
            3,
            EngagementCounts {
                likes: 10,
                reposts: 2,
                replies: 1,
                quotes: 1,
                bookmarks: 0,
            },
        )];
        state.quotes.insert(
            original.clone(),
            vec![fetched(
                "at://did:plc:q/app.bsky.feed.post/q1",
                3,
                EngagementCounts {
                    likes: 4,
                    ..Default::default()
                },
            )],
        );
    }

    let report = collect::run_cycle(&ctx, &source, day(4)).await.unwrap();
    assert_eq!(report.posts_observed, 1);
    assert_eq!(report.rollups, 1);

    let posts = ctx.db.get_posts_created_on(day(3)).await.unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].observed_on, day(4));
    assert_eq!(posts[0].indirect.likes, 4);

    let rollups = ctx.db.get_rollups(day(3), day(3)).await.unwrap();
    // 10 + 2*2 + 1*3 direct, plus half of 4 indirect likes
    assert_eq!(rollups[0].total_score, 19.0);
    assert_eq!(rollups[0].best_post_uri.as_deref(), Some(original.as_str()));
}

#[tokio::test]
async fn test_interactions_stored_and_ranked() {
    let ctx = test_ctx(50);
    let source = source_with_followers(&["did:plc:a"]);
    source.state.lock().unwrap().interactions = vec![
        InteractionRow {
            stable_id: "did:plc:fan".to_string(),
            handle: "fan.test".to_string(),
            date: day(1),
            counts: InteractionCounts {
                likes: 3,
                replies: 1,
                ..Default::default()
            },
            last_interaction: None,
        },
        InteractionRow {
            stable_id: "did:plc:lurker".to_string(),
            handle: "lurker.test".to_string(),
            date: day(1),
            counts: InteractionCounts {
                likes: 1,
                ..Default::default()
            },
            last_interaction: None,
        },
    ];

    let report = collect::run_cycle(&ctx, &source, day(1)).await.unwrap();
    assert_eq!(report.interactions, 2);

    let top = tidemark::engagement::interactions::top_interactors(ctx.db.as_ref(), day(1), day(1), 10)
        .await
        .unwrap();
    assert_eq!(top[0].stable_id, "did:plc:fan");
    assert_eq!(top[0].score, 8);
    assert_eq!(top[1].score, 1);
}
