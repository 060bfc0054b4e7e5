// Per-account interaction ranking.
//
// Each interaction type has a fixed weight reflecting effort: a like is a
// tap, a reply is a conversation. Rankings are derived on read from the
// per-day rows and never stored.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;

use crate::db::models::{InteractionCounts, InteractionRow, InteractionScore};
use crate::db::Database;

pub const LIKE_WEIGHT: u64 = 1;
pub const REPOST_WEIGHT: u64 = 2;
pub const FOLLOW_WEIGHT: u64 = 3;
pub const QUOTE_WEIGHT: u64 = 4;
pub const REPLY_WEIGHT: u64 = 5;

pub fn weighted_score(c: &InteractionCounts) -> u64 {
    u64::from(c.likes) * LIKE_WEIGHT
        + u64::from(c.reposts) * REPOST_WEIGHT
        + u64::from(c.follows) * FOLLOW_WEIGHT
        + u64::from(c.quotes) * QUOTE_WEIGHT
        + u64::from(c.replies) * REPLY_WEIGHT
}

/// Sum per-day rows into one score per account and rank them.
///
/// Ties on score are broken by stable_id so the ranking is deterministic.
/// The most recent handle seen for an account is the one reported.
pub fn rank(rows: &[InteractionRow], limit: usize) -> Vec<InteractionScore> {
    let mut by_account: HashMap<&str, (InteractionScore, NaiveDate)> = HashMap::new();

    for row in rows {
        let entry = by_account
            .entry(row.stable_id.as_str())
            .or_insert_with(|| {
                (
                    InteractionScore {
                        stable_id: row.stable_id.clone(),
                        handle: row.handle.clone(),
                        counts: InteractionCounts::default(),
                        score: 0,
                        last_interaction: None,
                    },
                    row.date,
                )
            });
        let (acc, handle_date) = entry;

        acc.counts = acc.counts.saturating_add(&row.counts);

        if row.date >= *handle_date {
            acc.handle = row.handle.clone();
            *handle_date = row.date;
        }
        acc.last_interaction = acc.last_interaction.max(row.last_interaction);
    }

    let mut ranked: Vec<InteractionScore> = by_account
        .into_values()
        .map(|(mut s, _)| {
            s.score = weighted_score(&s.counts);
            s
        })
        .collect();

    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.stable_id.cmp(&b.stable_id)));
    ranked.truncate(limit);
    ranked
}

/// Top interactors over a date range.
pub async fn top_interactors(
    db: &dyn Database,
    from: NaiveDate,
    to: NaiveDate,
    limit: usize,
) -> Result<Vec<InteractionScore>> {
    let rows = db.get_interaction_rows(from, to).await?;
    Ok(rank(&rows, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(id: &str, handle: &str, d: u32, counts: InteractionCounts) -> InteractionRow {
        InteractionRow {
            stable_id: id.to_string(),
            handle: handle.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 8, d).unwrap(),
            counts,
            last_interaction: Some(Utc.with_ymd_and_hms(2024, 8, d, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_weights() {
        let c = InteractionCounts {
            likes: 1,
            reposts: 1,
            replies: 1,
            quotes: 1,
            follows: 1,
        };
        assert_eq!(weighted_score(&c), 15);
    }

    #[test]
    fn test_rank_sums_days_and_orders() {
        let rows = vec![
            row("did:plc:a", "a.old", 1, InteractionCounts { likes: 3, ..Default::default() }),
            row("did:plc:a", "a.new", 2, InteractionCounts { replies: 1, ..Default::default() }),
            row("did:plc:b", "b", 1, InteractionCounts { quotes: 2, ..Default::default() }),
            row("did:plc:c", "c", 2, InteractionCounts { likes: 1, ..Default::default() }),
        ];
        let ranked = rank(&rows, 10);

        assert_eq!(ranked.len(), 3);
        // a = 3 + 5 = 8, b = 8, tie broken by stable_id
        assert_eq!(ranked[0].stable_id, "did:plc:a");
        assert_eq!(ranked[0].score, 8);
        assert_eq!(ranked[0].handle, "a.new");
        assert_eq!(ranked[1].stable_id, "did:plc:b");
        assert_eq!(ranked[2].score, 1);
        assert_eq!(
            ranked[0].last_interaction,
            Some(Utc.with_ymd_and_hms(2024, 8, 2, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_rank_saturates_instead_of_overflowing() {
        let heavy = InteractionCounts {
            likes: u32::MAX,
            follows: 1,
            ..Default::default()
        };
        let rows = vec![
            row("did:plc:a", "a", 1, heavy),
            row("did:plc:a", "a", 2, InteractionCounts { likes: 7, replies: 2, ..Default::default() }),
        ];
        let ranked = rank(&rows, 10);

        assert_eq!(ranked[0].counts.likes, u32::MAX);
        assert_eq!(ranked[0].counts.replies, 2);
        assert_eq!(ranked[0].counts.follows, 1);
        assert_eq!(ranked[0].score, u64::from(u32::MAX) + 2 * REPLY_WEIGHT + FOLLOW_WEIGHT);
    }

    #[test]
    fn test_rank_applies_limit() {
        let rows = vec![
            row("did:plc:a", "a", 1, InteractionCounts { likes: 1, ..Default::default() }),
            row("did:plc:b", "b", 1, InteractionCounts { likes: 2, ..Default::default() }),
        ];
        let ranked = rank(&rows, 1);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].stable_id, "did:plc:b");
    }
}
