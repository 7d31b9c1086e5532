//! Compact command implementation.
//!
//! Rewrites segment logs so each serialized key appears once, holding its
//! newest write. Deletion records are kept: they may shadow older tiers.

use super::{open_engine_dir, CommandResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tierdb_core::{category, DurableLog, LogOptions, LogRecord};
use tracing::warn;

/// Compaction statistics.
#[derive(Debug, Default, Serialize)]
pub struct CompactStats {
    /// Logs rewritten (or that would be).
    pub logs_compacted: usize,
    /// Logs left alone because they hold unreadable records.
    pub logs_skipped: usize,
    /// Input records.
    pub input_records: usize,
    /// Output records.
    pub output_records: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool, format: &str) -> CommandResult {
    let (provider, meta) = open_engine_dir(path)?;

    if format != "json" {
        println!("Compacting segment logs at {}", path.display());
        if dry_run {
            println!("(dry run - no changes will be made)");
        }
        println!();
    }

    let mut stats = CompactStats::default();
    let ids = std::iter::once(meta.mutable_segment).chain(meta.read_only_segments.iter().copied());
    for id in ids {
        if !provider.exists(id.as_u64(), category::SEGMENT_LOG) {
            continue;
        }
        let log = DurableLog::open(
            Arc::clone(&provider),
            id,
            category::SEGMENT_LOG,
            LogOptions::default().sync_on_write(true),
        )?;
        let read = log.read_all()?;
        if !read.is_clean() {
            warn!(segment_id = %id, issues = read.causes.len(), "skipping unreadable log");
            stats.logs_skipped += 1;
            continue;
        }

        let survivors = newest_per_key(read.records.iter().cloned());
        stats.logs_compacted += 1;
        stats.input_records += read.records.len();
        stats.output_records += survivors.len();
        stats.bytes_before += read.valid_len;
        stats.bytes_after += survivors.iter().map(|r| r.encoded_len() as u64).sum::<u64>();

        if !dry_run {
            log.replace(&survivors)?;
        }
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
        _ => print_text_output(&stats, dry_run),
    }
    Ok(())
}

/// Keeps the last record of every key, in op index order.
fn newest_per_key(records: impl IntoIterator<Item = LogRecord>) -> Vec<LogRecord> {
    let mut latest: BTreeMap<Vec<u8>, LogRecord> = BTreeMap::new();
    for record in records {
        latest.insert(record.key.clone(), record);
    }
    let mut out: Vec<LogRecord> = latest.into_values().collect();
    out.sort_by_key(|r| r.op_index);
    out
}

fn print_text_output(stats: &CompactStats, dry_run: bool) {
    println!("Compaction Analysis:");
    println!("  Logs compacted:    {}", stats.logs_compacted);
    println!("  Logs skipped:      {}", stats.logs_skipped);
    println!("  Input records:     {}", stats.input_records);
    println!("  Output records:    {}", stats.output_records);
    println!();
    println!("  Size before: {} bytes", stats.bytes_before);
    println!("  Size after:  {} bytes", stats.bytes_after);
    let saved = stats.bytes_before.saturating_sub(stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if stats.bytes_before > 0 {
            (saved as f64 / stats.bytes_before as f64) * 100.0
        } else {
            0.0
        }
    );
    println!();
    if dry_run {
        println!("Run without --dry-run to apply.");
    } else {
        println!("✓ Compaction complete");
    }
}
