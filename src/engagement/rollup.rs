// Daily engagement rollups.
//
// A rollup for day D is always rebuilt from the posts created on D. Nothing
// is patched incrementally, so collection order and late archive arrivals
// cannot change the result for a day whose posts didn't change.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::debug;

use super::score::score;
use crate::db::models::{DailyEngagementRollup, EngagementCounts, EventSource, PostEngagement};
use crate::db::Database;

/// Pick the observation that represents each post: the latest live one,
/// or the archive one when the post was never seen live.
fn representative_observations<'a>(
    date: NaiveDate,
    posts: &'a [PostEngagement],
) -> BTreeMap<&'a str, &'a PostEngagement> {
    let mut chosen: BTreeMap<&str, &PostEngagement> = BTreeMap::new();
    for post in posts.iter().filter(|p| p.created_on() == date) {
        let replace = match chosen.get(post.post_uri.as_str()) {
            None => true,
            Some(current) => match (current.source, post.source) {
                (EventSource::Backfill, EventSource::Live) => true,
                (EventSource::Live, EventSource::Backfill) => false,
                _ => post.observed_on > current.observed_on,
            },
        };
        if replace {
            chosen.insert(post.post_uri.as_str(), post);
        }
    }
    chosen
}

/// Build the rollup for `date` from every stored observation of posts
/// created that day. Posts created on other days are ignored.
pub fn rollup(date: NaiveDate, posts: &[PostEngagement]) -> DailyEngagementRollup {
    let chosen = representative_observations(date, posts);

    let mut direct = EngagementCounts::default();
    let mut indirect = EngagementCounts::default();
    let mut total_score = 0.0;
    let mut posts_with_engagement = 0u32;
    let mut best: Option<(&str, f64)> = None;

    for (uri, post) in &chosen {
        direct = direct.saturating_add(&post.direct);
        indirect = indirect.saturating_add(&post.indirect);

        let s = score(post);
        total_score += s;
        if !post.direct.is_zero() || !post.indirect.is_zero() {
            posts_with_engagement += 1;
        }
        // Strictly greater keeps the lexically first URI on ties
        if s > 0.0 && best.map_or(true, |(_, b)| s > b) {
            best = Some((*uri, s));
        }
    }

    let post_count = chosen.len() as u32;
    let average_score = if post_count > 0 {
        total_score / f64::from(post_count)
    } else {
        0.0
    };

    DailyEngagementRollup {
        date,
        post_count,
        posts_with_engagement,
        direct,
        indirect,
        total_score,
        average_score,
        best_post_uri: best.map(|(uri, _)| uri.to_string()),
        best_post_score: best.map_or(0.0, |(_, s)| s),
    }
}

/// Recompute and store the rollup for one date. A day with no posts has
/// no rollup row.
pub async fn refresh_rollup(db: &dyn Database, date: NaiveDate) -> Result<Option<DailyEngagementRollup>> {
    let posts = db.get_posts_created_on(date).await?;
    let computed = rollup(date, &posts);

    if computed.post_count == 0 {
        db.delete_rollup(date).await?;
        return Ok(None);
    }

    debug!(
        %date,
        posts = computed.post_count,
        score = computed.total_score,
        "Rollup recomputed"
    );
    db.upsert_rollup(&computed).await?;
    Ok(Some(computed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn obs(uri: &str, created: u32, observed: u32, likes: u32, source: EventSource) -> PostEngagement {
        PostEngagement {
            post_uri: uri.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 7, created, 9, 30, 0).unwrap(),
            observed_on: day(observed),
            text: None,
            is_reply: false,
            reply_to_uri: None,
            direct: EngagementCounts {
                likes,
                ..Default::default()
            },
            indirect: EngagementCounts::default(),
            source,
        }
    }

    #[test]
    fn test_empty_day() {
        let r = rollup(day(1), &[]);
        assert_eq!(r.post_count, 0);
        assert_eq!(r.average_score, 0.0);
        assert!(r.best_post_uri.is_none());
    }

    #[test]
    fn test_latest_live_observation_wins() {
        let posts = vec![
            obs("at://p/1", 1, 1, 3, EventSource::Live),
            obs("at://p/1", 1, 3, 7, EventSource::Live),
            obs("at://p/1", 1, 1, 0, EventSource::Backfill),
        ];
        let r = rollup(day(1), &posts);
        assert_eq!(r.post_count, 1);
        assert_eq!(r.direct.likes, 7);
        assert!((r.total_score - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_archive_only_posts_count() {
        let posts = vec![
            obs("at://p/1", 2, 2, 0, EventSource::Backfill),
            obs("at://p/2", 2, 2, 4, EventSource::Live),
        ];
        let r = rollup(day(2), &posts);
        assert_eq!(r.post_count, 2);
        assert_eq!(r.posts_with_engagement, 1);
        assert!((r.average_score - 2.0).abs() < 1e-9);
        assert_eq!(r.best_post_uri.as_deref(), Some("at://p/2"));
    }

    #[test]
    fn test_order_invariant() {
        let mut posts = vec![
            obs("at://p/a", 3, 3, 5, EventSource::Live),
            obs("at://p/b", 3, 4, 2, EventSource::Live),
            obs("at://p/c", 3, 3, 5, EventSource::Backfill),
        ];
        let forward = rollup(day(3), &posts);
        posts.reverse();
        assert_eq!(rollup(day(3), &posts), forward);
        // Tie on score goes to the first URI
        assert_eq!(forward.best_post_uri.as_deref(), Some("at://p/a"));
    }

    #[test]
    fn test_posts_from_other_days_ignored() {
        let posts = vec![obs("at://p/1", 4, 4, 1, EventSource::Live)];
        assert_eq!(rollup(day(5), &posts).post_count, 0);
    }
}
