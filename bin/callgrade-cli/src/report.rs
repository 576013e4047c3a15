//! Terminal rendering and file exports for a finished run.

use anyhow::{Context, Result};
use callgrade_types::{AnalysisResult, CallRecord, RunSummary, ScoreBand};
use chrono::Local;
use serde::Serialize;
use std::path::Path;

const BAR_WIDTH: usize = 20;

fn local_time(r: &chrono::DateTime<chrono::Utc>) -> String {
    r.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub fn print_calls(calls: &[CallRecord]) {
    println!("{:<14} {:<17} TITLE", "ID", "CREATED");
    for c in calls {
        println!("{:<14} {:<17} {}", c.id, local_time(&c.created_at), c.title);
    }
    println!("{} call(s) with recordings", calls.len());
}

/// `█` blocks proportional to `score` on a 0..=5 scale.
pub fn score_bar(score: f64) -> String {
    let filled = ((score.clamp(0.0, 5.0) / 5.0) * BAR_WIDTH as f64).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

fn band_label(band: ScoreBand) -> &'static str {
    match band {
        ScoreBand::Green => "🟢 good",
        ScoreBand::Yellow => "🟡 fair",
        ScoreBand::Red => "🔴 needs work",
    }
}

pub fn print_summary(summary: &RunSummary) {
    for r in &summary.results {
        println!();
        println!("── Call {} ({}) ──", r.call_id, local_time(&r.created_at));
        println!("Transcript: {}", r.display_transcript());
        println!("Analysis:\n{}", r.analysis.trim_end());
        println!("Score: {:.1}/5", r.score);
    }

    if !summary.skipped.is_empty() {
        println!();
        println!("Skipped:");
        for s in &summary.skipped {
            println!("  {} at {}: {}", s.call_id, s.stage, s.reason);
        }
    }

    println!();
    match (summary.mean_score(), summary.band()) {
        (Some(mean), Some(band)) => {
            println!("Mean score: {mean:.2}/5 {} {}", score_bar(mean), band_label(band));
            println!("Distribution:");
            for (bucket, count) in summary.distribution() {
                println!("  {bucket}/5 {}", "■".repeat(count));
            }
        }
        _ => println!("No call could be analysed."),
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    call_id: &'a str,
    created_at: String,
    score: f64,
    transcript: &'a str,
    analysis: &'a str,
}

pub fn write_csv(path: &Path, results: &[AnalysisResult]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("cannot create {}", path.display()))?;
    for r in results {
        wtr.serialize(CsvRow {
            call_id: &r.call_id,
            created_at: r.created_at.to_rfc3339(),
            score: r.score,
            transcript: &r.transcript,
            analysis: &r.analysis,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_json(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("cannot write {}", path.display()))?;
    Ok(())
}
