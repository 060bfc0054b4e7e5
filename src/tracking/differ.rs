// Snapshot differ: turns two adjacent member lists into change events.
//
// Membership is compared by stable_id only. A handle change on the same DID
// is not a transition. With no previous snapshot there is no baseline, so
// nothing is emitted.

use std::collections::HashMap;

use crate::db::models::{ChangeEvent, Direction, EventSource, Member, MemberSnapshot};
use crate::error::{TrackerError, TrackerResult};

/// Compute the added and removed members between `prev` and `curr`.
///
/// Output is sorted by (direction, stable_id), so two calls on the same pair
/// return identical vectors. Removed members carry the handle from `prev`;
/// added members carry the handle from `curr`.
pub fn diff(prev: Option<&MemberSnapshot>, curr: &MemberSnapshot) -> TrackerResult<Vec<ChangeEvent>> {
    let Some(prev) = prev else {
        return Ok(Vec::new());
    };

    if prev.kind != curr.kind {
        return Err(TrackerError::InconsistentState(format!(
            "cannot diff a {} snapshot against a {} snapshot",
            prev.kind, curr.kind
        )));
    }
    if prev.date > curr.date {
        return Err(TrackerError::InconsistentState(format!(
            "{} snapshot for {} is newer than the one for {}",
            curr.kind, prev.date, curr.date
        )));
    }

    let before: HashMap<&str, &Member> = prev
        .members()
        .iter()
        .map(|m| (m.stable_id.as_str(), m))
        .collect();
    let after: HashMap<&str, &Member> = curr
        .members()
        .iter()
        .map(|m| (m.stable_id.as_str(), m))
        .collect();

    let event = |direction: Direction, member: &Member| ChangeEvent {
        date: curr.date,
        kind: curr.kind,
        direction,
        stable_id: member.stable_id.clone(),
        handle: member.handle.clone(),
        cause: None,
        source: EventSource::Live,
    };

    let mut events: Vec<ChangeEvent> = curr
        .members()
        .iter()
        .filter(|m| !before.contains_key(m.stable_id.as_str()))
        .map(|m| event(Direction::Added, m))
        .chain(
            prev.members()
                .iter()
                .filter(|m| !after.contains_key(m.stable_id.as_str()))
                .map(|m| event(Direction::Removed, m)),
        )
        .collect();

    events.sort_by(|a, b| {
        a.direction
            .cmp(&b.direction)
            .then_with(|| a.stable_id.cmp(&b.stable_id))
    });
    Ok(events)
}
