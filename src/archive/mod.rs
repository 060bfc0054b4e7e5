// Repository archive decoding: CAR v1 files of DAG-CBOR blocks.
//
// Blocks are read as a stream and decoded into an arena keyed by CID, so
// links between blocks resolve by lookup. Once every block is in, the commit
// is followed to the MST and each entry's record is typed. A bad block costs
// only the records it held.

pub mod car;
pub mod cbor;
pub mod cid;
pub mod mst;
pub mod records;
pub mod varint;

use std::collections::{HashMap, HashSet};
use std::io::Read;

use tracing::{debug, warn};

use self::car::CarReader;
use self::cbor::Value;
use self::cid::{Cid, CODEC_DAG_CBOR};
use self::mst::Commit;
use self::records::ArchiveRecord;
use crate::error::TrackerResult;

/// Everything recovered from one archive.
#[derive(Debug, Default)]
pub struct DecodedArchive {
    /// `None` when the commit block was missing or unreadable.
    pub commit: Option<Commit>,
    pub records: Vec<ArchiveRecord>,
    /// Frames read from the stream, good or bad.
    pub blocks_read: u64,
    /// Records in projected collections that were seen in the tree.
    pub records_seen: u64,
    /// Blocks or records that could not be recovered.
    pub unrecoverable: u64,
    /// One message per failure, for the run's error summary.
    pub failures: Vec<String>,
}

impl DecodedArchive {
    fn fail(&mut self, msg: String) {
        warn!(error = %msg, "Unrecoverable archive content");
        self.unrecoverable += 1;
        self.failures.push(msg);
    }
}

/// A frame rejected by the reader. Its CID, when one was read, may itself be
/// the corrupted part, so the loss is only attributed once the tree is known.
struct FrameFailure {
    cid: Option<Cid>,
    message: String,
}

/// What the tree walk could not resolve.
#[derive(Default)]
struct TreeLosses {
    /// Failed blocks the tree links to.
    reached: HashSet<Cid>,
    /// Linked nodes and records with no block in the archive.
    missing: Vec<String>,
}

/// Decode an archive from a byte stream.
///
/// Only an unreadable CAR header fails the call. Individual bad blocks,
/// dangling links, and malformed records are counted in the result, each
/// lost record once.
pub fn decode_archive<R: Read>(reader: R) -> TrackerResult<DecodedArchive> {
    let car = CarReader::new(reader)?;
    let roots = car.header().roots.clone();

    let mut out = DecodedArchive::default();
    let mut blocks: HashMap<Cid, Value> = HashMap::new();
    let mut failed: HashSet<Cid> = HashSet::new();
    let mut frame_failures = Vec::new();

    for frame in car {
        out.blocks_read += 1;
        let block = match frame {
            Ok(block) => block,
            Err(failure) => {
                if let Some(cid) = failure.cid {
                    failed.insert(cid);
                }
                let message = match failure.cid {
                    Some(cid) => format!("block {cid}: {}", failure.error),
                    None => format!("block #{}: {}", out.blocks_read, failure.error),
                };
                frame_failures.push(FrameFailure {
                    cid: failure.cid,
                    message,
                });
                continue;
            }
        };

        if block.cid.codec() != CODEC_DAG_CBOR {
            // Raw blobs carry no records
            continue;
        }
        match cbor::decode(&block.data) {
            Ok(value) => {
                blocks.insert(block.cid, value);
            }
            Err(e) => {
                // The CID verified, so the tree will find this one by name
                failed.insert(block.cid);
                out.fail(format!("block {}: {e}", block.cid));
            }
        }
    }

    debug!(
        blocks = out.blocks_read,
        decoded = blocks.len(),
        rejected_frames = frame_failures.len(),
        "Archive blocks loaded"
    );

    let commit = roots
        .first()
        .and_then(|root| blocks.get(root))
        .and_then(|value| match mst::parse_commit(value) {
            Ok(commit) => Some(commit),
            Err(e) => {
                warn!(error = %e, "Archive commit unreadable, scanning blocks for records");
                None
            }
        });

    let losses = match &commit {
        Some(commit) => collect_from_tree(commit, &blocks, &failed, &mut out),
        None => {
            collect_by_scan(&blocks, &mut out);
            TreeLosses::default()
        }
    };
    settle_losses(frame_failures, losses, &mut out);
    out.commit = commit;

    Ok(out)
}

fn collect_from_tree(
    commit: &Commit,
    blocks: &HashMap<Cid, Value>,
    failed: &HashSet<Cid>,
    out: &mut DecodedArchive,
) -> TreeLosses {
    let walked = mst::walk(commit.data, blocks, failed);
    let mut losses = TreeLosses::default();
    losses.reached.extend(walked.failed_nodes);

    for cid in walked.missing_nodes {
        losses.missing.push(format!("tree node {cid} missing from archive"));
    }
    for (cid, reason) in walked.broken_nodes {
        out.fail(format!("tree node {cid}: {reason}"));
    }

    for entry in walked.entries {
        if failed.contains(&entry.value) {
            losses.reached.insert(entry.value);
        }
        let Some((collection, rkey)) = entry.split_key() else {
            out.fail(format!("tree key {:?} has no collection", entry.key));
            continue;
        };
        if !records::PROJECTED.contains(&collection) {
            continue;
        }
        out.records_seen += 1;

        if failed.contains(&entry.value) {
            // Counted with the block itself
            continue;
        }
        let Some(value) = blocks.get(&entry.value) else {
            losses
                .missing
                .push(format!("record {} ({}) missing from archive", entry.key, entry.value));
            continue;
        };

        match records::parse_record(collection, rkey, value) {
            Ok(Some(record)) => out.records.push(record),
            Ok(None) => {}
            Err(e) => out.fail(format!("record {}: {e}", entry.key)),
        }
    }

    losses
}

/// Count frame failures and unresolved links. A frame the tree never linked
/// to most likely held one of the missing blocks under a damaged CID, so
/// each such frame is paired with one missing link and the pair counts once.
fn settle_losses(frames: Vec<FrameFailure>, losses: TreeLosses, out: &mut DecodedArchive) {
    let mut orphans = Vec::new();
    for frame in frames {
        match frame.cid {
            Some(cid) if losses.reached.contains(&cid) => out.fail(frame.message),
            _ => orphans.push(frame.message),
        }
    }

    let mut orphans = orphans.into_iter();
    for missing in losses.missing {
        match orphans.next() {
            Some(frame) => out.fail(format!("{missing} (unmatched {frame})")),
            None => out.fail(missing),
        }
    }
    for frame in orphans {
        out.fail(frame);
    }
}

/// Fallback when there is no usable commit: take every block that declares
/// a projected `$type`. Record keys are unknown, so the block CID stands in.
fn collect_by_scan(blocks: &HashMap<Cid, Value>, out: &mut DecodedArchive) {
    let mut found: Vec<(&Cid, &str, &Value)> = blocks
        .iter()
        .filter_map(|(cid, value)| {
            let declared = value.record_type()?;
            records::PROJECTED
                .iter()
                .find(|c| **c == declared)
                .map(|c| (cid, *c, value))
        })
        .collect();
    found.sort_by_key(|(cid, _, _)| **cid);

    for (cid, collection, value) in found {
        out.records_seen += 1;
        match records::parse_record(collection, &cid.to_string(), value) {
            Ok(Some(record)) => out.records.push(record),
            Ok(None) => {}
            Err(e) => out.fail(format!("record block {cid}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> FrameFailure {
        FrameFailure {
            cid: Some(Cid::for_block(CODEC_DAG_CBOR, name.as_bytes())),
            message: format!("block {name}: digest mismatch"),
        }
    }

    #[test]
    fn test_unlinked_frame_pairs_with_missing_record() {
        let mut out = DecodedArchive::default();
        let losses = TreeLosses {
            reached: HashSet::new(),
            missing: vec!["record app.bsky.graph.follow/f042 missing from archive".to_string()],
        };

        settle_losses(vec![frame("damaged-cid")], losses, &mut out);

        assert_eq!(out.unrecoverable, 1);
        assert!(out.failures[0].contains("f042"));
        assert!(out.failures[0].contains("damaged-cid"));
    }

    #[test]
    fn test_linked_and_leftover_losses_count_separately() {
        let mut out = DecodedArchive::default();
        let linked = frame("linked");
        let losses = TreeLosses {
            reached: linked.cid.into_iter().collect(),
            missing: vec!["tree node x missing from archive".to_string(), "record y missing".to_string()],
        };
        let unread = FrameFailure {
            cid: None,
            message: "block #9: truncated".to_string(),
        };

        settle_losses(vec![linked, unread], losses, &mut out);

        // linked frame, node paired with the unread frame, record on its own
        assert_eq!(out.unrecoverable, 3);
        assert_eq!(out.failures[0], "block linked: digest mismatch");
        assert_eq!(out.failures[2], "record y missing");
    }
}
