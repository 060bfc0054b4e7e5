// Hidden-account classifier: decides why a follower disappeared.
//
// Priority order: the user's own block list, then their mute list, then the
// hidden-count heuristic backed by a failed profile lookup. Anything else is
// an organic unfollow. A lookup that was never attempted is not evidence.

use std::collections::HashSet;

use crate::db::models::{
    ChangeEvent, ClassificationEvidence, DateCounts, Direction, HiddenAccountRecord, LookupStatus,
    RelationKind, RemovalCause,
};
use crate::error::{TrackerError, TrackerResult};

/// Classify one removed-follower event.
///
/// `counts` must be the counts captured on the event's date. `muted` and
/// `blocked` are the stable ids in that date's muted and blocked sets.
pub fn classify(
    event: &ChangeEvent,
    counts: &DateCounts,
    muted: &HashSet<String>,
    blocked: &HashSet<String>,
    lookup: LookupStatus,
) -> TrackerResult<HiddenAccountRecord> {
    if event.kind != RelationKind::Followers || event.direction != Direction::Removed {
        return Err(TrackerError::Validation(format!(
            "only removed followers are classified, got {} {}",
            event.kind,
            event.direction.as_str()
        )));
    }
    if counts.date != event.date {
        return Err(TrackerError::InconsistentState(format!(
            "counts for {} used to classify a removal on {}",
            counts.date, event.date
        )));
    }

    let in_blocked_set = blocked.contains(&event.stable_id);
    let in_muted_set = muted.contains(&event.stable_id);
    let hidden_count = counts.hidden_followers();

    let cause = if in_blocked_set {
        RemovalCause::UserBlocked
    } else if in_muted_set {
        RemovalCause::UserMuted
    } else if hidden_count > 0 && lookup.is_unreachable() {
        RemovalCause::SuspectedBlockOrSuspension
    } else {
        RemovalCause::OrganicUnfollow
    };

    Ok(HiddenAccountRecord {
        stable_id: event.stable_id.clone(),
        handle: event.handle.clone(),
        removal_date: event.date,
        cause,
        evidence: ClassificationEvidence {
            reported_count: counts.reported_followers,
            api_visible_count: counts.api_followers,
            hidden_count,
            in_blocked_set,
            in_muted_set,
            lookup,
        },
    })
}
