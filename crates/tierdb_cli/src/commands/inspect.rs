//! Inspect command implementation.

use super::{open_engine_dir, store_size, CommandResult, RawSchema};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tierdb_core::{
    category, DiskSegment, DurableLog, EngineOptions, EventBus, LogOptions, SchemaTypes,
    SegmentId, TreeMeta,
};
use tierdb_storage::StoreProvider;

/// Engine inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Engine directory.
    pub path: String,
    /// Schema type names recorded at creation.
    pub schema: SchemaTypes,
    /// Mutable segment id.
    pub mutable_segment: SegmentId,
    /// Read-only segment ids, newest first.
    pub read_only_segments: Vec<SegmentId>,
    /// Disk segment id; 0 if none.
    pub disk_segment: SegmentId,
    /// Bottom segment ids, newest first.
    pub bottom_segments: Vec<SegmentId>,
    /// Highest operation index handed out.
    pub maximum_op_index: u64,
    /// Highest segment id handed out.
    pub maximum_segment_id: u64,
    /// Stored engine options.
    pub options: EngineOptions,
    /// Store counts and sizes per category.
    pub stores: Vec<CategoryStats>,
    /// Per-segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentStats>>,
}

/// Stores of one category.
#[derive(Debug, Serialize)]
pub struct CategoryStats {
    /// Category name.
    pub category: &'static str,
    /// Number of stores.
    pub count: usize,
    /// Total size in bytes.
    pub bytes: u64,
}

/// Statistics for a single segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// Segment id.
    pub id: SegmentId,
    /// Tier name.
    pub tier: &'static str,
    /// Records in the segment log or disk segment.
    pub records: usize,
    /// Disk segment parts; 0 for logged segments.
    pub parts: usize,
    /// Bytes on disk.
    pub bytes: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_segments: bool, format: &str) -> CommandResult {
    let (provider, meta) = open_engine_dir(path)?;

    let mut stores = Vec::new();
    for cat in [
        category::META,
        category::SEGMENT_LOG,
        category::DISK_HEADER,
        category::DISK_PART,
    ] {
        let ids = provider.list(cat)?;
        let bytes = ids
            .iter()
            .map(|id| store_size(provider.as_ref(), *id, cat))
            .sum();
        stores.push(CategoryStats {
            category: cat,
            count: ids.len(),
            bytes,
        });
    }

    let segments = if show_segments {
        Some(segment_stats(&provider, &meta)?)
    } else {
        None
    };

    let result = InspectResult {
        path: path.display().to_string(),
        schema: meta.schema,
        mutable_segment: meta.mutable_segment,
        read_only_segments: meta.read_only_segments,
        disk_segment: meta.disk_segment,
        bottom_segments: meta.bottom_segments,
        maximum_op_index: meta.maximum_op_index.0,
        maximum_segment_id: meta.maximum_segment_id,
        options: meta.options,
        stores,
        segments,
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn segment_stats(
    provider: &Arc<dyn StoreProvider>,
    meta: &TreeMeta,
) -> CommandResult<Vec<SegmentStats>> {
    let mut out = Vec::new();

    let logged = std::iter::once(("mutable", meta.mutable_segment))
        .chain(meta.read_only_segments.iter().map(|id| ("read-only", *id)));
    for (tier, id) in logged {
        let records = if provider.exists(id.as_u64(), category::SEGMENT_LOG) {
            DurableLog::open(
                Arc::clone(provider),
                id,
                category::SEGMENT_LOG,
                LogOptions::default(),
            )?
            .read_all()?
            .records
            .len()
        } else {
            0
        };
        out.push(SegmentStats {
            id,
            tier,
            records,
            parts: 0,
            bytes: store_size(provider.as_ref(), id.as_u64(), category::SEGMENT_LOG),
        });
    }

    let disks = std::iter::once(("disk", meta.disk_segment))
        .chain(meta.bottom_segments.iter().map(|id| ("bottom", *id)))
        .filter(|(_, id)| *id != SegmentId::EMPTY);
    for (tier, id) in disks {
        let segment = DiskSegment::<RawSchema>::open(
            Arc::clone(provider),
            id,
            meta.options.disk_segment,
            Arc::new(EventBus::new()),
        )?;
        let bytes = store_size(provider.as_ref(), id.as_u64(), category::DISK_HEADER)
            + segment
                .part_ids()
                .iter()
                .map(|part| store_size(provider.as_ref(), *part, category::DISK_PART))
                .sum::<u64>();
        out.push(SegmentStats {
            id,
            tier,
            records: segment.len(),
            parts: segment.part_count(),
            bytes,
        });
    }
    Ok(out)
}

fn print_text_output(result: &InspectResult) {
    let ids = |list: &[SegmentId]| {
        if list.is_empty() {
            "-".to_string()
        } else {
            list.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
    };

    println!("TierDB Engine: {}", result.path);
    println!();
    println!("Schema:");
    println!("  Key:              {}", result.schema.key_type);
    println!("  Value:            {}", result.schema.value_type);
    println!("  Comparer:         {}", result.schema.comparer_type);
    println!();
    println!("Segments:");
    println!("  Mutable:          {}", result.mutable_segment);
    println!("  Read-only:        {}", ids(&result.read_only_segments));
    println!("  Disk:             {}", result.disk_segment);
    println!("  Bottom:           {}", ids(&result.bottom_segments));
    println!();
    println!("Counters:");
    println!("  Max op index:     {}", result.maximum_op_index);
    println!("  Max segment id:   {}", result.maximum_segment_id);
    println!();
    println!("Stores:");
    for stats in &result.stores {
        println!(
            "  {:<6} {:>6} stores {:>12} bytes",
            stats.category, stats.count, stats.bytes
        );
    }

    if let Some(segments) = &result.segments {
        println!();
        println!("Segment Details:");
        for s in segments {
            println!(
                "  {:<9} {:>8}: {:>10} records {:>4} parts {:>12} bytes",
                s.tier, s.id, s.records, s.parts, s.bytes
            );
        }
    }
}
