// System status display: store size, latest snapshots, last cycle, last import.

use anyhow::Result;
use std::path::Path;

use crate::context::AppContext;
use crate::db::models::RelationKind;

/// Display system status to the terminal.
pub async fn show(ctx: &AppContext) -> Result<()> {
    let db_path = ctx.config.db_path.as_str();
    if !Path::new(db_path).exists() {
        println!("Database: not initialized");
        println!("\nRun `tidemark init` to set up the database.");
        return Ok(());
    }
    let db = ctx.db.as_ref();

    let file_size = std::fs::metadata(db_path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());
    println!("Database: {} ({})", db_path, file_size);

    match db.get_scan_state("tracked_did").await? {
        Some(did) => println!("Tracking: @{} ({})", ctx.config.bluesky_handle, did),
        None => println!("Tracking: @{} (not collected yet)", ctx.config.bluesky_handle),
    }

    for kind in RelationKind::ALL {
        match db.latest_snapshot_date(kind).await? {
            Some(date) => {
                let size = db
                    .get_snapshot(date, kind)
                    .await?
                    .map_or(0, |s| s.len());
                let days = db.snapshot_dates(kind).await?.len();
                println!(
                    "  {:<10} {} accounts (as of {}, {} days tracked)",
                    kind.as_str(),
                    size,
                    date,
                    days
                );
            }
            None => println!("  {:<10} no snapshots", kind.as_str()),
        }
    }

    match db.recent_collections(1).await?.first() {
        Some(entry) => {
            print!(
                "Last collection: {} ({}, {:.1}s)",
                entry.collection_date, entry.status, entry.duration_secs
            );
            match &entry.error {
                Some(err) => println!(" - {err}"),
                None => println!(),
            }
        }
        None => {
            println!("Last collection: never");
            println!("  Run `tidemark collect` to take the first snapshot");
        }
    }

    match db.list_backfill_runs().await?.first() {
        Some(run) => println!(
            "Last import: run #{} {} ({} rows merged, {} unrecoverable)",
            run.id, run.status, run.rows_merged, run.unrecoverable_records
        ),
        None => println!("Last import: none"),
    }

    if ctx.locks.collection_running() {
        println!("A collection cycle is running in this process.");
    }
    if ctx.locks.import_running() {
        println!("An import is running in this process.");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
