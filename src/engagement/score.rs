// Per-post engagement score.
//
// Replies weigh most because they take effort; reposts and bookmarks count
// double. Engagement on posts that quote this one is attributed back at half
// weight. Quote counts themselves are not part of the score: their effect
// shows up through the indirect counts.

use crate::db::models::{EngagementCounts, PostEngagement};

pub const LIKE_WEIGHT: f64 = 1.0;
pub const REPOST_WEIGHT: f64 = 2.0;
pub const REPLY_WEIGHT: f64 = 3.0;
pub const BOOKMARK_WEIGHT: f64 = 2.0;

/// Multiplier applied to engagement attributed through quoting posts.
pub const INDIRECT_FACTOR: f64 = 0.5;

fn weighted(c: &EngagementCounts) -> f64 {
    f64::from(c.likes) * LIKE_WEIGHT
        + f64::from(c.reposts) * REPOST_WEIGHT
        + f64::from(c.replies) * REPLY_WEIGHT
        + f64::from(c.bookmarks) * BOOKMARK_WEIGHT
}

pub fn direct_score(post: &PostEngagement) -> f64 {
    weighted(&post.direct)
}

pub fn indirect_score(post: &PostEngagement) -> f64 {
    INDIRECT_FACTOR * weighted(&post.indirect)
}

/// Total score for one post: direct plus discounted indirect.
pub fn score(post: &PostEngagement) -> f64 {
    direct_score(post) + indirect_score(post)
}

/// Sum the counts of the posts quoting an original post into its
/// indirect counts.
pub fn indirect_from_quotes(quoting: &[EngagementCounts]) -> EngagementCounts {
    quoting
        .iter()
        .fold(EngagementCounts::default(), |acc, c| acc.saturating_add(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventSource;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn post(direct: EngagementCounts, indirect: EngagementCounts) -> PostEngagement {
        PostEngagement {
            post_uri: "at://did:plc:me/app.bsky.feed.post/1".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
            observed_on: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            text: None,
            is_reply: false,
            reply_to_uri: None,
            direct,
            indirect,
            source: EventSource::Live,
        }
    }

    #[test]
    fn test_score_components() {
        let p = post(
            EngagementCounts {
                likes: 10,
                reposts: 2,
                replies: 1,
                quotes: 0,
                bookmarks: 0,
            },
            EngagementCounts {
                likes: 4,
                ..Default::default()
            },
        );
        assert!((direct_score(&p) - 17.0).abs() < 1e-9);
        assert!((indirect_score(&p) - 2.0).abs() < 1e-9);
        assert!((score(&p) - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_quotes_do_not_score_directly() {
        let p = post(
            EngagementCounts {
                quotes: 50,
                ..Default::default()
            },
            EngagementCounts::default(),
        );
        assert_eq!(score(&p), 0.0);
    }

    #[test]
    fn test_bookmarks_weigh_double() {
        let p = post(
            EngagementCounts {
                bookmarks: 3,
                ..Default::default()
            },
            EngagementCounts {
                bookmarks: 2,
                ..Default::default()
            },
        );
        assert!((score(&p) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_indirect_from_quotes_sums_each_dimension() {
        let quoting = [
            EngagementCounts {
                likes: 3,
                reposts: 1,
                ..Default::default()
            },
            EngagementCounts {
                likes: 2,
                replies: 4,
                ..Default::default()
            },
        ];
        let total = indirect_from_quotes(&quoting);
        assert_eq!(total.likes, 5);
        assert_eq!(total.reposts, 1);
        assert_eq!(total.replies, 4);
        assert!(indirect_from_quotes(&[]).is_zero());
    }
}
