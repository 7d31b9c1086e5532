//! Verify command implementation.

use super::{open_engine_dir, CommandResult, RawSchema};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tierdb_core::{category, DiskSegment, DurableLog, EventBus, LogOptions, SegmentId, TreeMeta};
use tierdb_storage::StoreProvider;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Number of stores checked.
    pub stores_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
    /// Findings that do not fail verification.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
///
/// `check_key_order` additionally requires disk segment keys to ascend
/// bytewise, which only holds for schemas whose serialized keys sort like
/// the keys themselves.
pub fn run(
    path: &Path,
    check_logs: bool,
    check_disk: bool,
    check_key_order: bool,
) -> CommandResult {
    println!("Verifying engine at {}", path.display());
    println!();

    let (provider, meta) = open_engine_dir(path)?;
    let mut log_result = VerifyResult::default();
    let mut disk_result = VerifyResult::default();

    if check_logs {
        println!("Checking segment logs...");
        log_result = verify_logs(&provider, &meta)?;
        print_result("Segment logs", &log_result);
    }

    if check_disk {
        println!("Checking disk segments...");
        disk_result = verify_disk_segments(&provider, &meta, check_key_order)?;
        print_result("Disk segments", &disk_result);
    }

    println!();
    if log_result.is_ok() && disk_result.is_ok() {
        println!("✓ Engine verification passed");
        Ok(())
    } else {
        println!("✗ Engine verification failed");
        Err("Verification failed".into())
    }
}

fn verify_logs(provider: &Arc<dyn StoreProvider>, meta: &TreeMeta) -> CommandResult<VerifyResult> {
    let mut result = VerifyResult::default();
    let referenced: BTreeSet<u64> = std::iter::once(meta.mutable_segment)
        .chain(meta.read_only_segments.iter().copied())
        .map(SegmentId::as_u64)
        .collect();
    let stored: BTreeSet<u64> = provider.list(category::SEGMENT_LOG)?.into_iter().collect();

    for id in referenced.difference(&stored) {
        // A mutable segment that never saw a write has no log yet.
        if *id != meta.mutable_segment.as_u64() {
            result.errors.push(format!("segment log {id} is missing"));
        }
    }
    for id in stored.difference(&referenced) {
        result
            .warnings
            .push(format!("segment log {id} is not referenced and will be removed on open"));
    }

    for id in referenced.intersection(&stored) {
        let log = DurableLog::open(
            Arc::clone(provider),
            SegmentId::new(*id),
            category::SEGMENT_LOG,
            LogOptions::default(),
        )?;
        let read = log.read_all()?;
        result.stores_checked += 1;
        result.records_checked += read.records.len();
        if read.is_torn_tail_only() {
            result.warnings.push(format!(
                "segment log {id}: torn final record after {} bytes",
                read.valid_len
            ));
        } else {
            for issue in &read.causes {
                result.errors.push(format!("segment log {id}: {issue}"));
            }
        }
    }
    Ok(result)
}

fn verify_disk_segments(
    provider: &Arc<dyn StoreProvider>,
    meta: &TreeMeta,
    check_key_order: bool,
) -> CommandResult<VerifyResult> {
    let mut result = VerifyResult::default();
    let ids = std::iter::once(meta.disk_segment)
        .chain(meta.bottom_segments.iter().copied())
        .filter(|id| *id != SegmentId::EMPTY);

    let mut referenced_parts = BTreeSet::new();
    let mut referenced_headers = BTreeSet::new();
    for id in ids {
        referenced_headers.insert(id.as_u64());
        let segment = match DiskSegment::<RawSchema>::open(
            Arc::clone(provider),
            id,
            meta.options.disk_segment,
            Arc::new(EventBus::new()),
        ) {
            Ok(segment) => Arc::new(segment),
            Err(e) => {
                result.errors.push(format!("disk segment {id}: {e}"));
                continue;
            }
        };
        referenced_parts.extend(segment.part_ids());
        result.stores_checked += 1 + segment.part_count();

        let errors_before = result.errors.len();
        let mut count = 0usize;
        let mut last: Option<Vec<u8>> = None;
        for entry in segment.iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    result
                        .errors
                        .push(format!("disk segment {id}: record {count}: {e}"));
                    break;
                }
            };
            if check_key_order {
                if let Some(prev) = &last {
                    if prev >= &entry.key {
                        result
                            .errors
                            .push(format!("disk segment {id}: keys out of order at record {count}"));
                        break;
                    }
                }
                last = Some(entry.key);
            }
            count += 1;
        }
        result.records_checked += count;
        if count != segment.len() && result.errors.len() == errors_before {
            result.errors.push(format!(
                "disk segment {id}: read {count} records, header says {}",
                segment.len()
            ));
        }
    }

    for id in provider.list(category::DISK_HEADER)? {
        if !referenced_headers.contains(&id) {
            result
                .warnings
                .push(format!("disk header {id} is not referenced"));
        }
    }
    for id in provider.list(category::DISK_PART)? {
        if !referenced_parts.contains(&id) {
            result.warnings.push(format!("disk part {id} is not referenced"));
        }
    }
    Ok(result)
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {name}:");
    println!("    Stores checked:  {}", result.stores_checked);
    println!("    Records checked: {}", result.records_checked);
    for warning in &result.warnings {
        println!("    ! {warning}");
    }
    if result.is_ok() {
        println!("    Status: ✓ OK");
    } else {
        println!("    Errors: {}", result.errors.len());
        for error in &result.errors {
            println!("    ✗ {error}");
        }
    }
}
