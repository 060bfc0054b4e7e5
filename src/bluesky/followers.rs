// Social graph listings, one page at a time.
//
// Followers and follows come from the public AppView. The user's own block
// records live in their repo, so that list is read from the PDS with
// `com.atproto.repo.listRecords`. Pages are returned raw; walking the cursor
// (and retrying a failed page) is the caller's job.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::client::{ListRecordsResponse, PublicAtpClient};
use crate::db::models::Member;

/// Largest page the graph endpoints accept.
pub const PAGE_LIMIT: &str = "100";

/// One page of a member listing.
#[derive(Debug, Clone, Default)]
pub struct MemberPage {
    pub members: Vec<Member>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
struct ProfileView {
    did: String,
    handle: String,
}

#[derive(Deserialize)]
struct FollowersResponse {
    followers: Vec<ProfileView>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct FollowsResponse {
    follows: Vec<ProfileView>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct BlockRecordValue {
    subject: String,
}

fn page_params<'a>(actor_key: &'a str, actor: &'a str, cursor: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut params = vec![(actor_key, actor), ("limit", PAGE_LIMIT)];
    if let Some(c) = cursor {
        params.push(("cursor", c));
    }
    params
}

fn to_members(profiles: Vec<ProfileView>) -> Vec<Member> {
    profiles
        .into_iter()
        .map(|p| Member::new(p.did, p.handle))
        .collect()
}

pub async fn fetch_followers_page(
    client: &PublicAtpClient,
    did: &str,
    cursor: Option<&str>,
) -> Result<MemberPage> {
    let output: FollowersResponse = client
        .xrpc_get("app.bsky.graph.getFollowers", &page_params("actor", did, cursor))
        .await
        .with_context(|| format!("Failed to fetch followers for {did}"))?;

    debug!(page_size = output.followers.len(), "Fetched page of followers");
    Ok(MemberPage {
        members: to_members(output.followers),
        cursor: output.cursor,
    })
}

pub async fn fetch_follows_page(
    client: &PublicAtpClient,
    did: &str,
    cursor: Option<&str>,
) -> Result<MemberPage> {
    let output: FollowsResponse = client
        .xrpc_get("app.bsky.graph.getFollows", &page_params("actor", did, cursor))
        .await
        .with_context(|| format!("Failed to fetch follows for {did}"))?;

    debug!(page_size = output.follows.len(), "Fetched page of follows");
    Ok(MemberPage {
        members: to_members(output.follows),
        cursor: output.cursor,
    })
}

/// A page of the user's block records. `pds` must be the client for the
/// user's own PDS. Blocked accounts are identified by DID only.
pub async fn fetch_blocks_page(pds: &PublicAtpClient, did: &str, cursor: Option<&str>) -> Result<MemberPage> {
    let mut params = page_params("repo", did, cursor);
    params.push(("collection", "app.bsky.graph.block"));

    let output: ListRecordsResponse = pds
        .xrpc_get("com.atproto.repo.listRecords", &params)
        .await
        .with_context(|| format!("Failed to list block records for {did}"))?;

    let mut members = Vec::with_capacity(output.records.len());
    for record in output.records {
        match serde_json::from_value::<BlockRecordValue>(record.value) {
            Ok(block) => members.push(Member::new(block.subject.clone(), block.subject)),
            Err(e) => warn!(uri = %record.uri, error = %e, "Skipping malformed block record"),
        }
    }

    debug!(page_size = members.len(), "Fetched page of block records");
    Ok(MemberPage {
        members,
        cursor: output.cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_params_with_cursor() {
        let params = page_params("actor", "did:plc:me", Some("abc"));
        assert_eq!(
            params,
            vec![("actor", "did:plc:me"), ("limit", "100"), ("cursor", "abc")]
        );
        assert_eq!(page_params("repo", "did:plc:me", None).len(), 2);
    }

    #[test]
    fn test_followers_response_shape() {
        let output: FollowersResponse = serde_json::from_str(
            r#"{"subject":{"did":"did:plc:me","handle":"me.test"},
                "followers":[{"did":"did:plc:a","handle":"a.test","displayName":"A"}],
                "cursor":"next"}"#,
        )
        .unwrap();
        let members = to_members(output.followers);
        assert_eq!(members, vec![Member::new("did:plc:a", "a.test")]);
        assert_eq!(output.cursor.as_deref(), Some("next"));
    }
}
