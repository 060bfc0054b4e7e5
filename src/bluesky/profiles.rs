// Profile reads: the tracked account's self-reported counts, and direct
// lookups of accounts that disappeared from the follower list.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::client::{PublicAtpClient, XrpcErrorBody};
use crate::db::models::LookupStatus;

/// Counts a profile reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileCounts {
    pub followers: i64,
    pub following: i64,
    pub posts: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileViewDetailed {
    #[allow(dead_code)]
    did: String,
    followers_count: Option<i64>,
    follows_count: Option<i64>,
    posts_count: Option<i64>,
}

pub async fn fetch_profile_counts(client: &PublicAtpClient, actor: &str) -> Result<ProfileCounts> {
    let profile: ProfileViewDetailed = client
        .xrpc_get("app.bsky.actor.getProfile", &[("actor", actor)])
        .await
        .with_context(|| format!("Failed to fetch profile for {actor}"))?;

    Ok(ProfileCounts {
        followers: profile.followers_count.unwrap_or(0),
        following: profile.follows_count.unwrap_or(0),
        posts: profile.posts_count.unwrap_or(0),
    })
}

/// Map an XRPC error response from `getProfile` to a lookup status.
fn status_from_error(body: &XrpcErrorBody) -> LookupStatus {
    match body.error.as_deref() {
        Some("AccountTakedown") => LookupStatus::Suspended,
        Some("AccountDeactivated") => LookupStatus::Deactivated,
        _ if body.status == 400 || body.status == 404 => LookupStatus::NotFound,
        _ => LookupStatus::Error,
    }
}

/// Look up a single account directly. Never fails: transport problems
/// come back as `LookupStatus::Error`.
pub async fn lookup_profile(client: &PublicAtpClient, did: &str) -> LookupStatus {
    let status = match client
        .xrpc_get_or_error::<ProfileViewDetailed>("app.bsky.actor.getProfile", &[("actor", did)])
        .await
    {
        Ok(Ok(_)) => LookupStatus::Found,
        Ok(Err(body)) => status_from_error(&body),
        Err(_) => LookupStatus::Error,
    };
    debug!(did, status = status.as_str(), "Profile lookup");
    status
}
