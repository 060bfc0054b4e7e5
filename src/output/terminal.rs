// Colored terminal output for history, classifications and engagement.
//
// main.rs fetches the data; everything about how it looks lives here.

use colored::Colorize;

use super::truncate_chars;
use crate::db::models::{
    BackfillRun, ChangeEvent, DailyCountsRow, DailyEngagementRollup, Direction, EngagementBalance,
    FollowerVelocity, HiddenAccountRecord, InteractionScore, Member, RemovalCause, RunStatus,
};
use crate::pipeline::collect::CycleReport;
use crate::pipeline::reconcile::ReconcileSummary;

/// Display change events, grouped by date as they arrive (already sorted).
pub fn display_changes(events: &[ChangeEvent]) {
    if events.is_empty() {
        println!("No changes in this range.");
        return;
    }

    println!(
        "\n{}",
        format!("=== Changes ({} events) ===", events.len()).bold()
    );

    let mut current_date = None;
    for event in events {
        if current_date != Some(event.date) {
            println!("\n  {}", event.date.to_string().bold());
            current_date = Some(event.date);
        }
        let arrow = match event.direction {
            Direction::Added => "+".green(),
            Direction::Removed => "-".red(),
        };
        let cause = event
            .cause
            .map(|c| format!(" [{}]", colorize_cause(c)))
            .unwrap_or_default();
        println!(
            "    {} {:<10} @{:<32} {}{}",
            arrow,
            event.kind.as_str(),
            truncate_chars(&event.handle, 32),
            event.source.as_str().dimmed(),
            cause
        );
    }
    println!();
}

/// Display classified removals with their evidence.
pub fn display_hidden(records: &[HiddenAccountRecord]) {
    if records.is_empty() {
        println!("No hidden removals in this range.");
        return;
    }

    println!(
        "\n{}",
        format!("=== Hidden Removals ({}) ===", records.len()).bold()
    );
    println!(
        "  {:<10}  {:<32} {:<30} {:>8}  {}",
        "Date".dimmed(),
        "Handle".dimmed(),
        "Cause".dimmed(),
        "Hidden".dimmed(),
        "Lookup".dimmed(),
    );
    println!("  {}", "-".repeat(92).dimmed());

    for record in records {
        println!(
            "  {:<10}  @{:<31} {:<30} {:>8}  {}",
            record.removal_date,
            truncate_chars(&record.handle, 30),
            colorize_cause(record.cause),
            record.evidence.hidden_count,
            record.evidence.lookup.as_str(),
        );
    }
    println!();
    println!(
        "  {}",
        "Suspected entries are a best-effort label; check the evidence columns.".dimmed()
    );
}

/// Display per-day counts alongside follower velocity.
pub fn display_daily_counts(rows: &[DailyCountsRow], velocity: &[FollowerVelocity]) {
    if rows.is_empty() {
        return;
    }
    println!("\n{}", "=== Daily Counts ===".bold());
    println!(
        "  {:<10}  {:>9} {:>9} {:>7} {:>6} {:>8} {:>10}  {:>6}",
        "Date".dimmed(),
        "Reported".dimmed(),
        "Visible".dimmed(),
        "Hidden".dimmed(),
        "Muted".dimmed(),
        "Blocked".dimmed(),
        "Suspected".dimmed(),
        "Net".dimmed(),
    );
    for row in rows {
        let net = velocity
            .iter()
            .find(|v| v.date == row.counts.date)
            .map(|v| v.net_followers())
            .unwrap_or(0);
        let net_str = match net {
            n if n > 0 => format!("+{n}").green(),
            n if n < 0 => n.to_string().red(),
            n => n.to_string().normal(),
        };
        println!(
            "  {:<10}  {:>9} {:>9} {:>7} {:>6} {:>8} {:>10}  {:>6}",
            row.counts.date,
            row.counts.reported_followers,
            row.counts.api_followers,
            row.counts.hidden_followers(),
            row.muted_count,
            row.blocked_count,
            row.suspected_count,
            net_str,
        );
    }
    println!();
}

/// Display daily engagement rollups.
pub fn display_rollups(rollups: &[DailyEngagementRollup]) {
    if rollups.is_empty() {
        println!("No engagement rollups in this range.");
        return;
    }

    println!("\n{}", "=== Daily Engagement ===".bold());
    println!(
        "  {:<10}  {:>5} {:>7} {:>6} {:>7} {:>7} {:>8} {:>7}  {}",
        "Date".dimmed(),
        "Posts".dimmed(),
        "Engaged".dimmed(),
        "Likes".dimmed(),
        "Reposts".dimmed(),
        "Replies".dimmed(),
        "Score".dimmed(),
        "Avg".dimmed(),
        "Best post".dimmed(),
    );
    println!("  {}", "-".repeat(100).dimmed());

    for r in rollups {
        let best = r
            .best_post_uri
            .as_deref()
            .map(|uri| format!("{} ({:.1})", truncate_chars(uri, 48), r.best_post_score))
            .unwrap_or_default();
        println!(
            "  {:<10}  {:>5} {:>7} {:>6} {:>7} {:>7} {:>8.1} {:>7.2}  {}",
            r.date,
            r.post_count,
            r.posts_with_engagement,
            r.direct.likes,
            r.direct.reposts,
            r.direct.replies,
            r.total_score,
            r.average_score,
            best.dimmed(),
        );
    }
    println!();
}

/// Display the ranked interactor list.
pub fn display_top_interactors(scores: &[InteractionScore]) {
    if scores.is_empty() {
        println!("No interactions recorded in this range.");
        return;
    }

    println!(
        "\n{}",
        format!("=== Top Interactors ({}) ===", scores.len()).bold()
    );
    for (i, s) in scores.iter().enumerate() {
        println!(
            "  {:>3}. @{:<32} {:>6}  {}",
            i + 1,
            truncate_chars(&s.handle, 32),
            s.score.to_string().bold(),
            format!(
                "{}L {}R {}Re {}Q {}F",
                s.counts.likes, s.counts.reposts, s.counts.replies, s.counts.quotes, s.counts.follows
            )
            .dimmed(),
        );
    }
    println!();
}

/// Display the engagement the user gave to others.
pub fn display_balance(balance: &EngagementBalance) {
    println!("\n{}", "=== Engagement Given ===".bold());
    println!("  Likes:   {}", balance.likes);
    println!("  Reposts: {}", balance.reposts);
    println!("  Replies: {} (to others)", balance.replies);
    println!("  Total:   {}", balance.total.to_string().bold());
    println!();
}

/// Display one import run.
pub fn display_run(run: &BackfillRun) {
    let range = match (run.earliest_date, run.latest_date) {
        (Some(a), Some(b)) => format!("{a} .. {b}"),
        _ => "-".to_string(),
    };
    println!(
        "  #{:<4} {:<10} {:>7} merged {:>7} dup {:>4} conflict {:>4} lost  {}  {}",
        run.id,
        colorize_status(run.status),
        run.rows_merged,
        run.duplicates_skipped,
        run.merge_conflicts,
        run.unrecoverable_records,
        range,
        run.source_archive_hash.get(..12).unwrap_or(&run.source_archive_hash).dimmed(),
    );
    if let Some(err) = &run.error {
        println!("        {}", truncate_chars(err, 160).dimmed());
    }
}

pub fn display_runs(runs: &[BackfillRun]) {
    if runs.is_empty() {
        println!("No archive imports yet. Run `tidemark backfill <archive.car>`.");
        return;
    }
    println!("\n{}", format!("=== Import Runs ({}) ===", runs.len()).bold());
    for run in runs {
        display_run(run);
    }
    println!();
}

/// Summarize a finished collection cycle.
pub fn display_cycle(report: &CycleReport) {
    let date = report
        .date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "\n{} {} ({})",
        "Collection".bold(),
        date,
        report.status.as_str().green()
    );
    println!(
        "  Followers {}  Following {}  Muted {}  Blocked {}",
        report.followers, report.following, report.muted, report.blocked
    );
    println!(
        "  {} changes, {} removals classified, {} posts observed, {} rollups, {} interactions ({:.1}s)",
        report.events,
        report.classified,
        report.posts_observed,
        report.rollups,
        report.interactions,
        report.duration_secs
    );
}

pub fn display_members(title: &str, members: &[Member]) {
    println!("\n{}", format!("=== {} ({}) ===", title, members.len()).bold());
    for m in members {
        println!("  @{:<32} {}", truncate_chars(&m.handle, 32), m.stable_id.dimmed());
    }
}

pub fn display_reconcile(summary: &ReconcileSummary) {
    println!(
        "Rebuilt {} live events, {} classifications, {} rollups.",
        summary.live_events, summary.classified, summary.rollups
    );
    if !summary.skipped_dates.is_empty() {
        let dates: Vec<String> = summary.skipped_dates.iter().map(|d| d.to_string()).collect();
        println!(
            "{} no counts recorded for {}; removals on those days stay unclassified.",
            "Skipped:".yellow(),
            dates.join(", ")
        );
    }
}

fn colorize_cause(cause: RemovalCause) -> colored::ColoredString {
    match cause {
        RemovalCause::UserBlocked => cause.as_str().red(),
        RemovalCause::UserMuted => cause.as_str().yellow(),
        RemovalCause::SuspectedBlockOrSuspension => cause.as_str().bright_red().bold(),
        RemovalCause::OrganicUnfollow => cause.as_str().dimmed(),
    }
}

fn colorize_status(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Partial => status.as_str().yellow(),
        RunStatus::Failed => status.as_str().red().bold(),
        RunStatus::Cancelled | RunStatus::Skipped => status.as_str().dimmed(),
        RunStatus::Running => status.as_str().cyan(),
    }
}
