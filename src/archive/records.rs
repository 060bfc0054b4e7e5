// Typed repository records.
//
// Record blocks are converted to the JSON data model and deserialized with
// serde, the same shapes `com.atproto.repo.listRecords` returns. Only the
// collections the importer projects are typed; everything else is skipped.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::cbor::Value;
use crate::error::{TrackerError, TrackerResult};

pub const FOLLOW: &str = "app.bsky.graph.follow";
pub const BLOCK: &str = "app.bsky.graph.block";
pub const LIKE: &str = "app.bsky.feed.like";
pub const REPOST: &str = "app.bsky.feed.repost";
pub const POST: &str = "app.bsky.feed.post";

/// Collections the importer turns into rows.
pub const PROJECTED: [&str; 5] = [FOLLOW, BLOCK, LIKE, REPOST, POST];

#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveRecord {
    Follow {
        rkey: String,
        subject: String,
        created_at: DateTime<Utc>,
    },
    Block {
        rkey: String,
        subject: String,
        created_at: DateTime<Utc>,
    },
    Like {
        rkey: String,
        subject_uri: String,
        created_at: DateTime<Utc>,
    },
    Repost {
        rkey: String,
        subject_uri: String,
        created_at: DateTime<Utc>,
    },
    Post {
        rkey: String,
        text: String,
        created_at: DateTime<Utc>,
        reply_parent: Option<String>,
    },
}

impl ArchiveRecord {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ArchiveRecord::Follow { created_at, .. }
            | ArchiveRecord::Block { created_at, .. }
            | ArchiveRecord::Like { created_at, .. }
            | ArchiveRecord::Repost { created_at, .. }
            | ArchiveRecord::Post { created_at, .. } => *created_at,
        }
    }
}

// -- Serde shapes for the record values --

#[derive(Deserialize)]
struct SubjectDidRecord {
    subject: String,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Deserialize)]
struct StrongRef {
    uri: String,
}

#[derive(Deserialize)]
struct SubjectRefRecord {
    subject: StrongRef,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Deserialize)]
struct ReplyRef {
    parent: StrongRef,
}

#[derive(Deserialize)]
struct PostRecord {
    #[serde(default)]
    text: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    reply: Option<ReplyRef>,
}

fn parse_timestamp(raw: &str) -> TrackerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrackerError::decode(format!("bad createdAt {raw:?}: {e}")))
}

fn typed<T: for<'de> Deserialize<'de>>(collection: &str, value: &Value) -> TrackerResult<T> {
    serde_json::from_value(value.to_json())
        .map_err(|e| TrackerError::decode(format!("malformed {collection} record: {e}")))
}

/// Parse one record. Returns `Ok(None)` for collections we don't project.
pub fn parse_record(collection: &str, rkey: &str, value: &Value) -> TrackerResult<Option<ArchiveRecord>> {
    if let Some(declared) = value.record_type() {
        if declared != collection {
            return Err(TrackerError::decode(format!(
                "record {collection}/{rkey} declares $type {declared}"
            )));
        }
    }

    let rkey = rkey.to_string();
    let record = match collection {
        FOLLOW => {
            let r: SubjectDidRecord = typed(collection, value)?;
            ArchiveRecord::Follow {
                rkey,
                subject: r.subject,
                created_at: parse_timestamp(&r.created_at)?,
            }
        }
        BLOCK => {
            let r: SubjectDidRecord = typed(collection, value)?;
            ArchiveRecord::Block {
                rkey,
                subject: r.subject,
                created_at: parse_timestamp(&r.created_at)?,
            }
        }
        LIKE => {
            let r: SubjectRefRecord = typed(collection, value)?;
            ArchiveRecord::Like {
                rkey,
                subject_uri: r.subject.uri,
                created_at: parse_timestamp(&r.created_at)?,
            }
        }
        REPOST => {
            let r: SubjectRefRecord = typed(collection, value)?;
            ArchiveRecord::Repost {
                rkey,
                subject_uri: r.subject.uri,
                created_at: parse_timestamp(&r.created_at)?,
            }
        }
        POST => {
            let r: PostRecord = typed(collection, value)?;
            ArchiveRecord::Post {
                rkey,
                text: r.text,
                created_at: parse_timestamp(&r.created_at)?,
                reply_parent: r.reply.map(|reply| reply.parent.uri),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(record))
}

/// The DID in an `at://did/collection/rkey` URI.
pub fn uri_authority(uri: &str) -> Option<&str> {
    uri.strip_prefix("at://")?
        .split('/')
        .next()
        .filter(|did| did.starts_with("did:"))
}
