// Shared fixtures for integration tests: a DAG-CBOR encoder, a repository
// archive builder, and an in-memory GraphSource.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use tidemark::archive::cbor::Value;
use tidemark::archive::cid::{Cid, CODEC_DAG_CBOR};
use tidemark::archive::varint;
use tidemark::bluesky::followers::MemberPage;
use tidemark::bluesky::posts::FetchedPost;
use tidemark::bluesky::profiles::ProfileCounts;
use tidemark::bluesky::GraphSource;
use tidemark::config::Config;
use tidemark::context::AppContext;
use tidemark::db::models::{InteractionRow, LookupStatus, Member, RelationKind};

pub const ME: &str = "did:plc:tidemarktest";

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

/// Noon UTC on March `d`, as an RFC 3339 string.
pub fn noon(d: u32) -> String {
    format!("2024-03-{d:02}T12:00:00.000Z")
}

pub fn test_ctx(batch_size: usize) -> AppContext {
    let config = Config {
        bluesky_handle: "tidemark.test".to_string(),
        import_batch_size: batch_size,
        fetch_attempts: 2,
        ..Config::default()
    };
    AppContext::new(config, tidemark::db::in_memory().unwrap())
}

// ============================================================
// DAG-CBOR encoding
// ============================================================

fn head(major: u8, n: u64, out: &mut Vec<u8>) {
    let m = major << 5;
    if n < 24 {
        out.push(m | n as u8);
    } else if n <= 0xff {
        out.push(m | 24);
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(m | 25);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        out.push(m | 26);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        out.push(m | 27);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(0xf6),
        Value::Bool(b) => out.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Integer(i) if *i >= 0 => head(0, *i as u64, out),
        Value::Integer(i) => head(1, (-1 - *i) as u64, out),
        Value::Float(f) => {
            out.push(0xfb);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Bytes(b) => {
            head(2, b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            head(3, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            head(4, items.len() as u64, out);
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(map) => {
            // DAG-CBOR key order: shorter keys first, then bytewise
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
            head(5, keys.len() as u64, out);
            for key in keys {
                head(3, key.len() as u64, out);
                out.extend_from_slice(key.as_bytes());
                encode_into(&map[key], out);
            }
        }
        Value::Link(cid) => {
            out.extend_from_slice(&[0xd8, 0x2a]);
            let bytes = cid.to_bytes();
            head(2, bytes.len() as u64 + 1, out);
            out.push(0x00);
            out.extend_from_slice(&bytes);
        }
    }
}

pub fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

// ============================================================
// Archive building
// ============================================================

/// Builds a CAR archive: commit root, one flat MST node, record blocks.
pub struct RepoFixture {
    did: String,
    records: Vec<(String, Value)>,
    corrupt: HashSet<String>,
    corrupt_cids: HashSet<String>,
    omit_commit: bool,
}

impl RepoFixture {
    pub fn new(did: &str) -> Self {
        Self {
            did: did.to_string(),
            records: Vec::new(),
            corrupt: HashSet::new(),
            corrupt_cids: HashSet::new(),
            omit_commit: false,
        }
    }

    pub fn record(&mut self, collection: &str, rkey: &str, value: Value) -> &mut Self {
        self.records.push((format!("{collection}/{rkey}"), value));
        self
    }

    pub fn follow(&mut self, rkey: &str, subject: &str, created_at: &str) -> &mut Self {
        let value = map(vec![
            ("$type", text("app.bsky.graph.follow")),
            ("subject", text(subject)),
            ("createdAt", text(created_at)),
        ]);
        self.record("app.bsky.graph.follow", rkey, value)
    }

    pub fn block(&mut self, rkey: &str, subject: &str, created_at: &str) -> &mut Self {
        let value = map(vec![
            ("$type", text("app.bsky.graph.block")),
            ("subject", text(subject)),
            ("createdAt", text(created_at)),
        ]);
        self.record("app.bsky.graph.block", rkey, value)
    }

    pub fn like(&mut self, rkey: &str, subject_uri: &str, created_at: &str) -> &mut Self {
        let value = map(vec![
            ("$type", text("app.bsky.feed.like")),
            (
                "subject",
                map(vec![("uri", text(subject_uri)), ("cid", text("bafyfake"))]),
            ),
            ("createdAt", text(created_at)),
        ]);
        self.record("app.bsky.feed.like", rkey, value)
    }

    pub fn post(&mut self, rkey: &str, body: &str, created_at: &str, reply_parent: Option<&str>) -> &mut Self {
        let mut pairs = vec![
            ("$type", text("app.bsky.feed.post")),
            ("text", text(body)),
            ("createdAt", text(created_at)),
            ("langs", Value::Array(vec![text("en")])),
        ];
        if let Some(parent) = reply_parent {
            let strong = map(vec![("uri", text(parent)), ("cid", text("bafyfake"))]);
            pairs.push(("reply", map(vec![("parent", strong.clone()), ("root", strong)])));
        }
        self.record("app.bsky.feed.post", rkey, map(pairs))
    }

    /// Write the record stored under `collection/rkey` with bytes that no
    /// longer match its CID.
    pub fn corrupt(&mut self, collection: &str, rkey: &str) -> &mut Self {
        self.corrupt.insert(format!("{collection}/{rkey}"));
        self
    }

    /// Write the frame of `collection/rkey` under a CID whose last digest
    /// byte is flipped. The tree still links the true CID.
    pub fn corrupt_cid(&mut self, collection: &str, rkey: &str) -> &mut Self {
        self.corrupt_cids.insert(format!("{collection}/{rkey}"));
        self
    }

    /// Leave the commit block out, forcing the decoder to scan for records.
    pub fn without_commit(&mut self) -> &mut Self {
        self.omit_commit = true;
        self
    }

    pub fn to_car(&self) -> Vec<u8> {
        let mut blocks: Vec<(Cid, Vec<u8>)> = Vec::new();

        let mut entries: Vec<(String, Cid)> = Vec::new();
        let mut bad_frames: HashSet<Cid> = HashSet::new();
        for (key, value) in &self.records {
            let data = encode(value);
            let cid = Cid::for_block(CODEC_DAG_CBOR, &data);
            let stored = if self.corrupt.contains(key) {
                let mut bad = data.clone();
                let last = bad.len() - 1;
                bad[last] ^= 0xff;
                bad
            } else {
                data
            };
            if self.corrupt_cids.contains(key) {
                bad_frames.insert(cid);
            }
            blocks.push((cid, stored));
            entries.push((key.clone(), cid));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut prev: &[u8] = &[];
        let mut tree_entries = Vec::new();
        for (key, cid) in &entries {
            let bytes = key.as_bytes();
            let shared = prev.iter().zip(bytes).take_while(|(a, b)| a == b).count();
            tree_entries.push(map(vec![
                ("p", Value::Integer(shared as i64)),
                ("k", Value::Bytes(bytes[shared..].to_vec())),
                ("v", Value::Link(*cid)),
                ("t", Value::Null),
            ]));
            prev = bytes;
        }
        let node = encode(&map(vec![("l", Value::Null), ("e", Value::Array(tree_entries))]));
        let node_cid = Cid::for_block(CODEC_DAG_CBOR, &node);
        blocks.push((node_cid, node));

        let commit = encode(&map(vec![
            ("did", text(&self.did)),
            ("version", Value::Integer(3)),
            ("data", Value::Link(node_cid)),
            ("rev", text("3kfixture")),
            ("prev", Value::Null),
            ("sig", Value::Bytes(vec![7; 64])),
        ]));
        let commit_cid = Cid::for_block(CODEC_DAG_CBOR, &commit);
        if !self.omit_commit {
            blocks.insert(0, (commit_cid, commit));
        }

        let header = encode(&map(vec![
            ("roots", Value::Array(vec![Value::Link(commit_cid)])),
            ("version", Value::Integer(1)),
        ]));

        let mut out = Vec::new();
        varint::encode(header.len() as u64, &mut out);
        out.extend_from_slice(&header);
        for (cid, data) in blocks {
            let mut cid_bytes = cid.to_bytes();
            if bad_frames.contains(&cid) {
                let last = cid_bytes.len() - 1;
                cid_bytes[last] ^= 0xff;
            }
            varint::encode((cid_bytes.len() + data.len()) as u64, &mut out);
            out.extend_from_slice(&cid_bytes);
            out.extend_from_slice(&data);
        }
        out
    }

    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.to_car()).unwrap();
        path
    }
}

// ============================================================
// In-memory GraphSource
// ============================================================

#[derive(Default)]
pub struct SourceState {
    pub counts: ProfileCounts,
    pub lists: HashMap<RelationKind, Vec<Member>>,
    pub lookups: HashMap<String, LookupStatus>,
    pub posts: Vec<FetchedPost>,
    pub quotes: HashMap<String, Vec<FetchedPost>>,
    pub interactions: Vec<InteractionRow>,
}

/// Serves whatever `state` holds. Lists are paged two members at a time
/// so pagination is exercised.
#[derive(Default)]
pub struct FakeSource {
    pub state: Mutex<SourceState>,
    /// Number of upcoming profile-count calls that fail.
    pub failures: AtomicU32,
    /// Number of upcoming recent-post calls that fail.
    pub post_failures: AtomicU32,
}

/// Consume one pending failure, if any.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeSource {
    pub fn set_list(&self, kind: RelationKind, ids: &[&str]) {
        let members = ids
            .iter()
            .map(|id| Member::new(*id, format!("{}.handle", id.trim_start_matches("did:plc:"))))
            .collect();
        self.state.lock().unwrap().lists.insert(kind, members);
    }

    pub fn set_counts(&self, followers: i64, following: i64) {
        self.state.lock().unwrap().counts = ProfileCounts {
            followers,
            following,
            posts: 0,
        };
    }
}

#[async_trait]
impl GraphSource for FakeSource {
    async fn resolve_did(&self, _handle: &str) -> Result<String> {
        Ok(ME.to_string())
    }

    async fn fetch_profile_counts(&self, _did: &str) -> Result<ProfileCounts> {
        if take_failure(&self.failures) {
            anyhow::bail!("simulated 503");
        }
        Ok(self.state.lock().unwrap().counts)
    }

    async fn fetch_member_page(
        &self,
        _did: &str,
        kind: RelationKind,
        cursor: Option<&str>,
    ) -> Result<MemberPage> {
        let state = self.state.lock().unwrap();
        let all = state.lists.get(&kind).cloned().unwrap_or_default();
        let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let end = (start + 2).min(all.len());
        Ok(MemberPage {
            members: all[start..end].to_vec(),
            cursor: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn lookup_profile(&self, stable_id: &str) -> LookupStatus {
        self.state
            .lock()
            .unwrap()
            .lookups
            .get(stable_id)
            .copied()
            .unwrap_or(LookupStatus::Found)
    }

    async fn fetch_recent_posts(&self, _did: &str, limit: usize) -> Result<Vec<FetchedPost>> {
        if take_failure(&self.post_failures) {
            anyhow::bail!("simulated timeout on author feed");
        }
        let state = self.state.lock().unwrap();
        Ok(state.posts.iter().take(limit).cloned().collect())
    }

    async fn fetch_quoting_posts(&self, post_uri: &str) -> Result<Vec<FetchedPost>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .quotes
            .get(post_uri)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_interactions(&self, _did: &str, date: NaiveDate) -> Result<Vec<InteractionRow>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .interactions
            .iter()
            .filter(|r| r.date == date)
            .cloned()
            .collect())
    }
}
