// The remote side of a collection cycle.
//
// The pipeline only talks to `GraphSource`; it never builds requests
// itself. `PublicGraphSource` implements it over the unauthenticated API,
// and tests substitute an in-memory source.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::OnceCell;
use tracing::debug;

use super::client::PublicAtpClient;
use super::followers::{self, MemberPage};
use super::posts::{self, FetchedPost};
use super::profiles::{self, ProfileCounts};
use crate::db::models::{InteractionRow, LookupStatus, RelationKind};

/// Everything a collection cycle fetches. Calls may fail transiently; the
/// caller retries.
#[async_trait]
pub trait GraphSource: Send + Sync {
    async fn resolve_did(&self, handle: &str) -> Result<String>;

    async fn fetch_profile_counts(&self, did: &str) -> Result<ProfileCounts>;

    /// One page of the `kind` listing for `did`.
    async fn fetch_member_page(
        &self,
        did: &str,
        kind: RelationKind,
        cursor: Option<&str>,
    ) -> Result<MemberPage>;

    /// Direct lookup of one account. Transport failures are reported as
    /// `LookupStatus::Error`, not as `Err`.
    async fn lookup_profile(&self, stable_id: &str) -> LookupStatus;

    async fn fetch_recent_posts(&self, did: &str, limit: usize) -> Result<Vec<FetchedPost>>;

    async fn fetch_quoting_posts(&self, post_uri: &str) -> Result<Vec<FetchedPost>>;

    /// Interactions received on `date`, aggregated per account.
    async fn fetch_interactions(&self, did: &str, date: NaiveDate) -> Result<Vec<InteractionRow>>;
}

/// `GraphSource` over the public AppView plus the user's PDS.
pub struct PublicGraphSource {
    appview: PublicAtpClient,
    pds: OnceCell<PublicAtpClient>,
}

impl PublicGraphSource {
    pub fn new(public_api_url: &str) -> Result<Self> {
        Ok(Self {
            appview: PublicAtpClient::new(public_api_url)?,
            pds: OnceCell::new(),
        })
    }

    pub fn client(&self) -> &PublicAtpClient {
        &self.appview
    }

    /// Client for the PDS hosting `did`, resolved once per source.
    pub async fn pds(&self, did: &str) -> Result<&PublicAtpClient> {
        self.pds
            .get_or_try_init(|| async {
                let url = self.appview.resolve_pds_url(did).await?;
                debug!(did, pds = %url, "Resolved PDS");
                PublicAtpClient::new(&url)
            })
            .await
    }
}

#[async_trait]
impl GraphSource for PublicGraphSource {
    async fn resolve_did(&self, handle: &str) -> Result<String> {
        if handle.starts_with("did:") {
            return Ok(handle.to_string());
        }
        self.appview.resolve_handle(handle).await
    }

    async fn fetch_profile_counts(&self, did: &str) -> Result<ProfileCounts> {
        profiles::fetch_profile_counts(&self.appview, did).await
    }

    async fn fetch_member_page(
        &self,
        did: &str,
        kind: RelationKind,
        cursor: Option<&str>,
    ) -> Result<MemberPage> {
        match kind {
            RelationKind::Followers => followers::fetch_followers_page(&self.appview, did, cursor).await,
            RelationKind::Following => followers::fetch_follows_page(&self.appview, did, cursor).await,
            RelationKind::Blocked => {
                let pds = self.pds(did).await?;
                followers::fetch_blocks_page(pds, did, cursor).await
            }
            // The mute list is private to an authenticated session
            RelationKind::Muted => Ok(MemberPage::default()),
        }
    }

    async fn lookup_profile(&self, stable_id: &str) -> LookupStatus {
        profiles::lookup_profile(&self.appview, stable_id).await
    }

    async fn fetch_recent_posts(&self, did: &str, limit: usize) -> Result<Vec<FetchedPost>> {
        posts::fetch_recent_posts(&self.appview, did, limit).await
    }

    async fn fetch_quoting_posts(&self, post_uri: &str) -> Result<Vec<FetchedPost>> {
        posts::fetch_quoting_posts(&self.appview, post_uri).await
    }

    async fn fetch_interactions(&self, _did: &str, _date: NaiveDate) -> Result<Vec<InteractionRow>> {
        // Notifications need a session; nothing is visible publicly
        Ok(Vec::new())
    }
}
