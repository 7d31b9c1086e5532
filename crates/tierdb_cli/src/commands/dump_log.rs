//! Dump log command implementation.

use super::{hex, open_engine_dir, CommandResult};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tierdb_core::{category, DurableLog, LogOptions, MetaLog, SegmentId};

/// Key bytes shown in text output.
const TEXT_KEY_BYTES: usize = 24;

/// Log record representation for output.
#[derive(Debug, Serialize)]
pub struct LogRecordInfo {
    /// Position in the log.
    pub index: usize,
    /// Operation index of the write.
    pub op_index: u64,
    /// Serialized key, hex-encoded.
    pub key: String,
    /// Serialized value size in bytes.
    pub value_size: usize,
}

/// Everything read from one log.
#[derive(Debug, Serialize)]
pub struct LogDump {
    /// Segment whose log was read.
    pub segment_id: SegmentId,
    /// Records in the log.
    pub total_records: usize,
    /// Records shown.
    pub records: Vec<LogRecordInfo>,
    /// Unreadable records, as descriptions.
    pub issues: Vec<String>,
}

/// Runs the dump-log command.
///
/// Dumps the log of `segment`, or of the mutable segment if none is given.
/// With `meta` the metadata snapshots are printed instead.
pub fn run(
    path: &Path,
    segment: Option<u64>,
    meta: bool,
    limit: Option<usize>,
    format: &str,
) -> CommandResult {
    let (provider, tree) = open_engine_dir(path)?;

    if meta {
        let snapshot = MetaLog::open(Arc::clone(&provider))?
            .load()?
            .ok_or("Engine metadata holds no readable snapshot")?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let segment_id = segment.map_or(tree.mutable_segment, SegmentId::new);
    if !provider.exists(segment_id.as_u64(), category::SEGMENT_LOG) {
        return Err(format!("Segment {segment_id} has no log").into());
    }
    let log = DurableLog::open(
        provider,
        segment_id,
        category::SEGMENT_LOG,
        LogOptions::default(),
    )?;
    let read = log.read_all()?;

    let records = read
        .records
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(index, record)| LogRecordInfo {
            index,
            op_index: record.op_index.0,
            key: hex(&record.key, usize::MAX),
            value_size: record.value.len(),
        })
        .collect();
    let dump = LogDump {
        segment_id,
        total_records: read.records.len(),
        records,
        issues: read.causes.iter().map(ToString::to_string).collect(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&dump)?),
        _ => print_text_output(&dump),
    }
    Ok(())
}

fn print_text_output(dump: &LogDump) {
    println!(
        "Segment {} log: {} records",
        dump.segment_id, dump.total_records
    );
    println!("{:-<72}", "");
    println!("{:>6}  {:>10}  {:>8}  KEY", "#", "OP", "VALUE");
    println!("{:-<72}", "");

    for record in &dump.records {
        let key = if record.key.len() > TEXT_KEY_BYTES * 2 {
            format!("{}..", &record.key[..TEXT_KEY_BYTES * 2])
        } else {
            record.key.clone()
        };
        println!(
            "{:>6}  {:>10}  {:>8}  {}",
            record.index, record.op_index, record.value_size, key
        );
    }

    println!("{:-<72}", "");
    println!(
        "Shown: {} of {} records",
        dump.records.len(),
        dump.total_records
    );
    for issue in &dump.issues {
        println!("✗ {issue}");
    }
}
