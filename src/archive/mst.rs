// Repository commit and Merkle Search Tree traversal.
//
// The commit names the repo DID and points at the MST root. Each MST node is
// `{l, e: [{p, k, v, t}]}`: `l` is the subtree left of the first entry, each
// entry's key is the previous key's first `p` bytes plus `k`, `v` links the
// record, and `t` is the subtree to the entry's right. Keys are
// `collection/rkey`.

use std::collections::{HashMap, HashSet};

use super::cbor::Value;
use super::cid::Cid;
use crate::error::{TrackerError, TrackerResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub did: String,
    pub version: i64,
    pub data: Cid,
    pub rev: Option<String>,
    pub prev: Option<Cid>,
}

pub fn parse_commit(value: &Value) -> TrackerResult<Commit> {
    let did = value
        .get("did")
        .and_then(Value::as_text)
        .ok_or_else(|| TrackerError::decode("commit has no did"))?;
    let version = value
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| TrackerError::decode("commit has no version"))?;
    let data = value
        .get("data")
        .and_then(Value::as_link)
        .ok_or_else(|| TrackerError::decode("commit has no data link"))?;

    Ok(Commit {
        did: did.to_string(),
        version,
        data: *data,
        rev: value.get("rev").and_then(Value::as_text).map(str::to_string),
        prev: value.get("prev").and_then(Value::as_link).copied(),
    })
}

/// One leaf of the tree: a record key and the CID of its record block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub key: String,
    pub value: Cid,
}

impl TreeEntry {
    /// Split `collection/rkey`.
    pub fn split_key(&self) -> Option<(&str, &str)> {
        self.key.split_once('/')
    }
}

#[derive(Debug, Default)]
pub struct TreeWalk {
    /// Entries in key order.
    pub entries: Vec<TreeEntry>,
    /// Node CIDs referenced but absent from the archive.
    pub missing_nodes: Vec<Cid>,
    /// Nodes present but malformed; their subtrees are lost.
    pub broken_nodes: Vec<(Cid, String)>,
    /// Nodes skipped because their block had already failed.
    pub failed_nodes: Vec<Cid>,
}

enum Step {
    Node(Cid),
    Entry(TreeEntry),
}

/// Walk the tree rooted at `root`, in key order.
///
/// Nodes listed in `failed` were already reported as unreadable blocks; they
/// are skipped and listed in `failed_nodes`.
pub fn walk(root: Cid, blocks: &HashMap<Cid, Value>, failed: &HashSet<Cid>) -> TreeWalk {
    let mut out = TreeWalk::default();
    let mut visited = HashSet::new();
    let mut stack = vec![Step::Node(root)];

    while let Some(step) = stack.pop() {
        let cid = match step {
            Step::Entry(entry) => {
                out.entries.push(entry);
                continue;
            }
            Step::Node(cid) => cid,
        };

        if !visited.insert(cid) {
            continue;
        }
        if failed.contains(&cid) {
            out.failed_nodes.push(cid);
            continue;
        }
        let Some(node) = blocks.get(&cid) else {
            out.missing_nodes.push(cid);
            continue;
        };

        match expand_node(node) {
            Ok(steps) => stack.extend(steps.into_iter().rev()),
            Err(e) => out.broken_nodes.push((cid, e.to_string())),
        }
    }

    out
}

/// Turn one node into its in-order steps: left subtree, then each entry
/// followed by its right subtree.
fn expand_node(node: &Value) -> TrackerResult<Vec<Step>> {
    let entries = node
        .get("e")
        .and_then(Value::as_array)
        .ok_or_else(|| TrackerError::decode("MST node has no entry list"))?;

    let mut steps = Vec::with_capacity(entries.len() * 2 + 1);
    if let Some(left) = node.get("l").and_then(Value::as_link) {
        steps.push(Step::Node(*left));
    }

    let mut prev_key: Vec<u8> = Vec::new();
    for entry in entries {
        let prefix_len = entry
            .get("p")
            .and_then(Value::as_i64)
            .and_then(|p| usize::try_from(p).ok())
            .ok_or_else(|| TrackerError::decode("MST entry has no prefix length"))?;
        let suffix = entry
            .get("k")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TrackerError::decode("MST entry has no key suffix"))?;
        let value = entry
            .get("v")
            .and_then(Value::as_link)
            .ok_or_else(|| TrackerError::decode("MST entry has no value link"))?;

        if prefix_len > prev_key.len() {
            return Err(TrackerError::decode(format!(
                "MST prefix {prefix_len} longer than previous key"
            )));
        }
        let mut key = prev_key[..prefix_len].to_vec();
        key.extend_from_slice(suffix);

        let key_str = String::from_utf8(key.clone())
            .map_err(|_| TrackerError::decode("MST key is not UTF-8"))?;
        steps.push(Step::Entry(TreeEntry {
            key: key_str,
            value: *value,
        }));
        if let Some(right) = entry.get("t").and_then(Value::as_link) {
            steps.push(Step::Node(*right));
        }
        prev_key = key;
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::cid::CODEC_DAG_CBOR;
    use std::collections::BTreeMap;

    fn map(pairs: Vec<(&str, Value)>) -> Value {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn cid(tag: &str) -> Cid {
        Cid::for_block(CODEC_DAG_CBOR, tag.as_bytes())
    }

    fn entry(p: i64, k: &str, v: Cid, t: Option<Cid>) -> Value {
        map(vec![
            ("p", Value::Integer(p)),
            ("k", Value::Bytes(k.as_bytes().to_vec())),
            ("v", Value::Link(v)),
            ("t", t.map_or(Value::Null, Value::Link)),
        ])
    }

    fn node(left: Option<Cid>, entries: Vec<Value>) -> Value {
        map(vec![
            ("l", left.map_or(Value::Null, Value::Link)),
            ("e", Value::Array(entries)),
        ])
    }

    #[test]
    fn test_parse_commit() {
        let commit = map(vec![
            ("did", Value::Text("did:plc:me".to_string())),
            ("version", Value::Integer(3)),
            ("data", Value::Link(cid("root"))),
            ("rev", Value::Text("3kabc".to_string())),
            ("prev", Value::Null),
        ]);
        let parsed = parse_commit(&commit).unwrap();
        assert_eq!(parsed.did, "did:plc:me");
        assert_eq!(parsed.data, cid("root"));
        assert!(parsed.prev.is_none());

        assert!(parse_commit(&map(vec![("did", Value::Text("x".into()))])).is_err());
    }

    #[test]
    fn test_walk_in_order_with_prefix_compression() {
        let (root, left, right) = (cid("root"), cid("left"), cid("right"));
        let mut blocks = HashMap::new();
        blocks.insert(
            left,
            node(None, vec![entry(0, "app.bsky.feed.like/1", cid("r1"), None)]),
        );
        blocks.insert(
            right,
            node(None, vec![entry(0, "app.bsky.graph.follow/9", cid("r4"), None)]),
        );
        blocks.insert(
            root,
            node(
                Some(left),
                vec![
                    entry(0, "app.bsky.feed.post/a", cid("r2"), None),
                    entry(19, "b", cid("r3"), Some(right)),
                ],
            ),
        );

        let walked = walk(root, &blocks, &HashSet::new());
        let keys: Vec<&str> = walked.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "app.bsky.feed.like/1",
                "app.bsky.feed.post/a",
                "app.bsky.feed.post/b",
                "app.bsky.graph.follow/9",
            ]
        );
        assert_eq!(walked.entries[2].split_key(), Some(("app.bsky.feed.post", "b")));
        assert!(walked.missing_nodes.is_empty());
    }

    #[test]
    fn test_missing_and_failed_subtrees() {
        let (root, gone, bad) = (cid("root"), cid("gone"), cid("bad"));
        let mut blocks = HashMap::new();
        blocks.insert(
            root,
            node(
                Some(gone),
                vec![entry(0, "app.bsky.feed.post/a", cid("r"), Some(bad))],
            ),
        );
        let failed: HashSet<Cid> = [bad].into_iter().collect();

        let walked = walk(root, &blocks, &failed);
        assert_eq!(walked.entries.len(), 1);
        assert_eq!(walked.missing_nodes, vec![gone]);
        assert_eq!(walked.failed_nodes, vec![bad]);
    }

    #[test]
    fn test_malformed_node_is_reported() {
        let root = cid("root");
        let mut blocks = HashMap::new();
        blocks.insert(root, node(None, vec![entry(5, "x", cid("r"), None)]));
        let walked = walk(root, &blocks, &HashSet::new());
        assert!(walked.entries.is_empty());
        assert_eq!(walked.broken_nodes.len(), 1);
    }
}
