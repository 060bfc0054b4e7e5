// History importer: one archive file in, one BackfillRun out.
//
// Phases: hash the file, decode the archive off the async runtime, project
// records to rows, merge in batches, then rebuild derived state for the
// dates the merge touched. The import slot is held for the whole run; the
// append lock only while a batch or the final reconcile is being written.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::merge::{affected_dates, project, report_conflicts};
use crate::archive::records::ArchiveRecord;
use crate::archive::{decode_archive, DecodedArchive};
use crate::context::AppContext;
use crate::db::models::{ArchiveRow, BackfillRun, MergeStats, RunStatus};
use crate::error::TrackerError;
use crate::pipeline::reconcile::reconcile_dates;

/// Failure messages kept in a run's error summary.
const MAX_REPORTED_FAILURES: usize = 5;

pub struct Importer {
    ctx: AppContext,
    cancel: Arc<AtomicBool>,
    repo_did: Option<String>,
    show_progress: bool,
    batch_limit: Option<usize>,
}

impl Importer {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            cancel: Arc::new(AtomicBool::new(false)),
            repo_did: None,
            show_progress: false,
            batch_limit: None,
        }
    }

    /// DID to use when the archive's commit can't be read.
    pub fn with_repo_did(mut self, did: impl Into<String>) -> Self {
        self.repo_did = Some(did.into());
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Stop as if cancelled once `n` batches have been merged.
    pub fn stop_after_batches(mut self, n: usize) -> Self {
        self.batch_limit = Some(n);
        self
    }

    /// Setting the returned flag stops the run before its next batch.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Import one archive file.
    ///
    /// Decode problems never fail the call: they end up in the returned run
    /// as `partial` (some records lost) or `failed` (nothing readable).
    /// Storage errors propagate after the run has been marked `failed`.
    pub async fn run(&self, archive_path: &Path) -> Result<BackfillRun> {
        let _slot = self.ctx.locks.try_import()?;
        let db = self.ctx.db.as_ref();

        let hash = hash_file(archive_path.to_path_buf()).await?;
        let previous = {
            let _read = self.ctx.locks.append_shared().await;
            db.find_completed_run(&hash).await?
        };

        let id = db.insert_backfill_run(&hash, Utc::now()).await?;
        let mut run = db
            .get_backfill_run(id)
            .await?
            .context("Backfill run missing right after insert")?;

        if let Some(previous) = previous {
            info!(run_id = id, previous, hash = %hash, "Archive already imported, skipping");
            run.status = RunStatus::Skipped;
            self.finish(&mut run).await?;
            return Ok(run);
        }

        info!(run_id = id, path = %archive_path.display(), "Starting archive import");

        let decoded = match decode_file(archive_path.to_path_buf()).await {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(run_id = id, error = %e, "Archive unreadable");
                run.status = RunStatus::Failed;
                run.error = Some(format!("{e:#}"));
                self.finish(&mut run).await?;
                return Ok(run);
            }
        };

        match self.merge_decoded(&mut run, decoded).await {
            Ok(()) => {
                self.finish(&mut run).await?;
                info!(
                    run_id = id,
                    status = %run.status,
                    merged = run.rows_merged,
                    duplicates = run.duplicates_skipped,
                    unrecoverable = run.unrecoverable_records,
                    "Archive import finished"
                );
                Ok(run)
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(format!("{e:#}"));
                if let Err(update) = self.finish(&mut run).await {
                    warn!(run_id = id, error = %update, "Could not record failed run");
                }
                Err(e)
            }
        }
    }

    async fn merge_decoded(&self, run: &mut BackfillRun, decoded: DecodedArchive) -> Result<()> {
        let db = self.ctx.db.as_ref();

        run.blocks_read = decoded.blocks_read;
        run.records_seen = decoded.records_seen;
        run.unrecoverable_records = decoded.unrecoverable;
        let mut failures = decoded.failures;

        let commit_did = decoded.commit.as_ref().map(|c| c.did.clone());
        if let (Some(found), Some(expected)) = (&commit_did, &self.repo_did) {
            if found != expected {
                warn!(found = %found, expected = %expected, "Archive belongs to a different account");
            }
        }
        run.repo_did = commit_did.or_else(|| self.repo_did.clone());

        let rows = self.project_records(decoded.records, run, &mut failures);
        run.earliest_date = rows.iter().map(ArchiveRow::date).min();
        run.latest_date = rows.iter().map(ArchiveRow::date).max();
        if !failures.is_empty() {
            run.error = Some(summarize_failures(&failures));
        }

        let pb = self.progress_bar(rows.len() as u64);
        let batch_size = self.ctx.config.import_batch_size.max(1);
        let mut stats = MergeStats::default();
        let mut touched: BTreeSet<_> = BTreeSet::new();
        let mut cancelled = false;

        for (n, batch) in rows.chunks(batch_size).enumerate() {
            if self.batch_limit.is_some_and(|limit| n >= limit) {
                self.cancel.store(true, Ordering::SeqCst);
            }
            if self.cancel.load(Ordering::SeqCst) {
                let reason = TrackerError::Cancelled;
                info!(run_id = run.id, batch = n, reason = %reason, "Import stopped before batch");
                cancelled = true;
                break;
            }

            let batch_stats = {
                let _append = self.ctx.locks.append_exclusive().await;
                db.merge_archive_batch(run.id, batch)
                    .await
                    .with_context(|| format!("Failed to merge batch {n}"))?
            };
            report_conflicts(run.id, &batch_stats);
            debug!(
                run_id = run.id,
                batch = n,
                inserted = batch_stats.inserted,
                duplicates = batch_stats.duplicates,
                "Batch merged"
            );

            touched.extend(affected_dates(batch));
            stats.absorb(batch_stats);
            run.rows_merged = stats.inserted;
            run.duplicates_skipped = stats.duplicates;
            run.merge_conflicts = stats.conflicts.len() as u64;
            db.update_backfill_run(run).await?;
            pb.inc(batch.len() as u64);
        }
        pb.finish_and_clear();

        if !touched.is_empty() {
            let _append = self.ctx.locks.append_exclusive().await;
            reconcile_dates(db, &touched).await?;
        }

        run.status = if cancelled {
            RunStatus::Cancelled
        } else if run.unrecoverable_records > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        Ok(())
    }

    /// Project records to rows. Post, like and repost URIs need the repo
    /// DID; without one those records are unrecoverable.
    fn project_records(
        &self,
        records: Vec<ArchiveRecord>,
        run: &mut BackfillRun,
        failures: &mut Vec<String>,
    ) -> Vec<ArchiveRow> {
        let repo_did = run.repo_did.clone();
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            match (&repo_did, record) {
                (Some(did), _) => rows.push(project(record, did)),
                (None, ArchiveRecord::Follow { .. } | ArchiveRecord::Block { .. }) => {
                    rows.push(project(record, ""));
                }
                (None, _) => {
                    run.unrecoverable_records += 1;
                    failures.push(format!(
                        "record created {} has no repository DID for its URI",
                        record.created_at()
                    ));
                }
            }
        }
        rows
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar().template("  Merging [{bar:30}] {pos}/{len} ({eta})") {
            pb.set_style(style);
        }
        pb
    }

    async fn finish(&self, run: &mut BackfillRun) -> Result<()> {
        run.finished_at = Some(Utc::now());
        self.ctx.db.update_backfill_run(run).await
    }
}

/// Hex sha-256 of the archive file, the run's dedup identity.
pub async fn hash_file(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut BufReader::new(file), &mut hasher)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .context("Hashing task panicked")?
}

async fn decode_file(path: PathBuf) -> Result<DecodedArchive> {
    tokio::task::spawn_blocking(move || -> Result<DecodedArchive> {
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(decode_archive(BufReader::new(file))?)
    })
    .await
    .context("Decoding task panicked")?
}

fn summarize_failures(failures: &[String]) -> String {
    let shown: Vec<&str> = failures
        .iter()
        .take(MAX_REPORTED_FAILURES)
        .map(String::as_str)
        .collect();
    let mut summary = format!("{} unrecoverable: {}", failures.len(), shown.join("; "));
    if failures.len() > MAX_REPORTED_FAILURES {
        summary.push_str("; ...");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_failures_truncates() {
        let failures: Vec<String> = (0..7).map(|i| format!("block {i}")).collect();
        let summary = summarize_failures(&failures);
        assert!(summary.starts_with("7 unrecoverable: block 0; block 1"));
        assert!(summary.ends_with("; ..."));
        assert!(!summary.contains("block 5"));
    }

    #[tokio::test]
    async fn test_hash_file_is_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.car");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let ctx = AppContext::new(Default::default(), crate::db::in_memory().unwrap());
        let importer = Importer::new(ctx);
        assert!(importer.run(Path::new("/nonexistent/archive.car")).await.is_err());
    }
}
