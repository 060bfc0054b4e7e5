// Post fetching: the tracked account's recent posts and the posts that
// quote them, each with its current engagement counts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::client::PublicAtpClient;
use crate::db::models::EngagementCounts;

/// Pages of quotes read per post before giving up on the tail.
const MAX_QUOTE_PAGES: usize = 5;

/// A post as seen through the AppView, with engagement at fetch time.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPost {
    pub uri: String,
    pub author_did: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_to_uri: Option<String>,
    pub counts: EngagementCounts,
}

#[derive(Deserialize)]
struct AuthorFeedResponse {
    feed: Vec<FeedViewPost>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct FeedViewPost {
    post: PostView,
    /// Present when the item is someone else's post reposted into the feed.
    reason: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct QuotesResponse {
    posts: Vec<PostView>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct Author {
    did: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    uri: String,
    author: Author,
    record: serde_json::Value,
    indexed_at: Option<String>,
    like_count: Option<u32>,
    repost_count: Option<u32>,
    reply_count: Option<u32>,
    quote_count: Option<u32>,
    bookmark_count: Option<u32>,
}

#[derive(Deserialize)]
struct StrongRef {
    uri: String,
}

#[derive(Deserialize)]
struct ReplyRef {
    parent: StrongRef,
}

#[derive(Deserialize)]
struct PostRecordView {
    #[serde(default)]
    text: String,
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
    reply: Option<ReplyRef>,
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl PostView {
    /// Flatten the view. Posts whose record has no usable timestamp fall
    /// back to the index time; with neither they are dropped.
    fn into_fetched(self) -> Option<FetchedPost> {
        let record: PostRecordView = match serde_json::from_value(self.record) {
            Ok(r) => r,
            Err(e) => {
                warn!(uri = %self.uri, error = %e, "Skipping post with unreadable record");
                return None;
            }
        };
        let created_at = record
            .created_at
            .as_deref()
            .and_then(parse_time)
            .or_else(|| self.indexed_at.as_deref().and_then(parse_time))?;

        Some(FetchedPost {
            uri: self.uri,
            author_did: self.author.did,
            text: record.text,
            created_at,
            reply_to_uri: record.reply.map(|r| r.parent.uri),
            counts: EngagementCounts {
                likes: self.like_count.unwrap_or(0),
                reposts: self.repost_count.unwrap_or(0),
                replies: self.reply_count.unwrap_or(0),
                quotes: self.quote_count.unwrap_or(0),
                bookmarks: self.bookmark_count.unwrap_or(0),
            },
        })
    }
}

/// Fetch the account's most recent posts and replies, newest first.
/// Reposts of other people's posts are skipped.
pub async fn fetch_recent_posts(client: &PublicAtpClient, did: &str, max_posts: usize) -> Result<Vec<FetchedPost>> {
    let mut posts = Vec::new();
    let mut cursor: Option<String> = None;
    let page_size = max_posts.clamp(1, 100).to_string();

    while posts.len() < max_posts {
        let mut params: Vec<(&str, &str)> = vec![
            ("actor", did),
            ("filter", "posts_with_replies"),
            ("limit", &page_size),
        ];
        if let Some(ref c) = cursor {
            params.push(("cursor", c));
        }

        let output: AuthorFeedResponse = client
            .xrpc_get("app.bsky.feed.getAuthorFeed", &params)
            .await
            .with_context(|| format!("Failed to fetch feed for {did}"))?;

        let page_len = output.feed.len();
        for item in output.feed {
            if item.reason.is_some() || item.post.author.did != did {
                continue;
            }
            if let Some(post) = item.post.into_fetched() {
                posts.push(post);
            }
            if posts.len() >= max_posts {
                break;
            }
        }

        debug!(page_posts = page_len, total = posts.len(), "Fetched page of posts");

        cursor = output.cursor;
        if cursor.is_none() || page_len == 0 {
            break;
        }
    }

    info!(count = posts.len(), did, "Collected recent posts");
    Ok(posts)
}

/// Fetch the posts quoting `post_uri`, with their own engagement.
pub async fn fetch_quoting_posts(client: &PublicAtpClient, post_uri: &str) -> Result<Vec<FetchedPost>> {
    let mut quotes = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_QUOTE_PAGES {
        let mut params: Vec<(&str, &str)> = vec![("uri", post_uri), ("limit", "100")];
        if let Some(ref c) = cursor {
            params.push(("cursor", c));
        }

        let output: QuotesResponse = client
            .xrpc_get("app.bsky.feed.getQuotes", &params)
            .await
            .with_context(|| format!("Failed to fetch quotes of {post_uri}"))?;

        let page_len = output.posts.len();
        quotes.extend(output.posts.into_iter().filter_map(PostView::into_fetched));

        cursor = output.cursor;
        if cursor.is_none() || page_len == 0 {
            break;
        }
    }

    Ok(quotes)
}
