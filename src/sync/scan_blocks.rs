//! Batched block scanning.
//!
//! The scan window (first unscanned block through the verified tip) is split
//! into fixed-size ranges that are downloaded, scanned, and committed one at
//! a time, so progress survives interruption at range granularity.

use std::collections::VecDeque;
use std::ops::Range;

use tokio::task;
use tracing::{debug, info};

use crate::client::ChainSource;
use crate::error::SyncError;
use crate::proto::CompactBlock;
use crate::scanning;
use crate::{AccountMeta, BlockHeight};

use super::{SyncObserver, SyncService, SyncStatus};

/// Maximum number of blocks scanned and committed as one range.
const SCAN_BATCH_SIZE: u32 = 1024;

/// Maximum number of blocks requested from the chain source per round trip.
const BLOCK_DOWNLOAD_BATCH_SIZE: u32 = 10;

/// The remaining scan work of one sync run.
pub(super) struct ScanBlocksTask {
    ranges: VecDeque<Range<BlockHeight>>,
    start: BlockHeight,
    end: BlockHeight,
    total_ranges: usize,
    ready_ranges: usize,
}

impl ScanBlocksTask {
    /// Plans a scan from the first unscanned block through the verified tip.
    /// Returns `None` when the account is already scanned to the tip.
    fn create(latest_scanned: BlockHeight, tip: BlockHeight) -> Option<Self> {
        if tip <= latest_scanned {
            return None;
        }
        let start = latest_scanned + 1;
        let end = tip + 1;
        let ranges = compute_scan_ranges(start, end);
        Some(ScanBlocksTask {
            total_ranges: ranges.len(),
            ready_ranges: 0,
            ranges,
            start,
            end,
        })
    }
}

/// Splits `start..end` into consecutive ranges of at most [`SCAN_BATCH_SIZE`]
/// blocks.
fn compute_scan_ranges(start: BlockHeight, end: BlockHeight) -> VecDeque<Range<BlockHeight>> {
    let mut ranges = VecDeque::new();
    let mut cursor = start;
    while cursor < end {
        let next = end.min(cursor + SCAN_BATCH_SIZE);
        ranges.push_back(cursor..next);
        cursor = next;
    }
    ranges
}

/// Scans the next pending range and commits its results, or plans the scan on
/// the first call. Marks the service finished once no ranges remain.
pub(super) async fn scan_next_range<C: ChainSource, O: SyncObserver>(
    service: &mut SyncService<C, O>,
    meta: AccountMeta,
    tip: BlockHeight,
) -> Result<(), SyncError> {
    let mut task = match service.scan_task.take() {
        Some(task) => task,
        None => match ScanBlocksTask::create(meta.latest_scanned_block, tip) {
            Some(task) => {
                info!(
                    account = %service.account_id,
                    start = %task.start,
                    end = %task.end,
                    ranges = task.total_ranges,
                    "Starting batch scan"
                );
                task
            }
            None => {
                debug!(account = %service.account_id, %tip, "Already scanned to the chain tip");
                service.finished = true;
                return Ok(());
            }
        },
    };

    let range = match task.ranges.pop_front() {
        Some(range) => range,
        None => {
            service.finished = true;
            return Ok(());
        }
    };

    // The tree state at the block before the range anchors both the trial
    // decryption (note positions) and the commitment inserts.
    let prior_height = range.start.saturating_sub(1);
    let chain_state = service
        .client
        .get_tree_state(prior_height)
        .await
        .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?
        .to_chain_state()
        .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?;

    let blocks = download_blocks(service, range.clone()).await?;

    let key = service.key.clone();
    let result = task::spawn_blocking(move || scanning::scan_blocks(&key, chain_state, blocks))
        .await
        .map_err(|e| SyncError::Scanner(e.to_string()))?
        .map_err(|e| SyncError::Scanner(e.to_string()))?;

    let last_height = result.last_scanned_height();
    let last_hash = result.last_scanned_hash();
    service
        .sync_state
        .update_notes(service.account_id, result, last_height, last_hash)
        .map_err(SyncError::FailedToUpdateDatabase)?;
    if let Some(meta) = service.account_meta.as_mut() {
        meta.latest_scanned_block = last_height;
        meta.latest_scanned_block_hash = last_hash;
    }

    let notes = service
        .sync_state
        .get_spendable_notes(service.account_id)
        .map_err(SyncError::FailedToRetrieveSpendableNotes)?;
    task.ready_ranges += 1;

    let status = SyncStatus {
        start: task.start,
        end: task.end,
        total_ranges: task.total_ranges,
        ready_ranges: task.ready_ranges,
        note_count: notes.len(),
        balance: notes.iter().map(|note| note.amount).sum(),
    };
    info!(
        account = %service.account_id,
        range_start = %range.start,
        range_end = %range.end,
        ready = task.ready_ranges,
        total = task.total_ranges,
        "Scan range committed"
    );
    service.scan_task = Some(task);
    service.spendable_notes = Some(notes);
    service
        .observer
        .on_sync_status_update(service.account_id, status);
    Ok(())
}

/// Downloads the blocks of `range` in fixed-size chunks, verifying that the
/// chain source returned every requested block.
async fn download_blocks<C: ChainSource, O: SyncObserver>(
    service: &mut SyncService<C, O>,
    range: Range<BlockHeight>,
) -> Result<Vec<CompactBlock>, SyncError> {
    let total = (u32::from(range.end) - u32::from(range.start)) as usize;
    let mut blocks = Vec::with_capacity(total);
    let mut cursor = range.start;
    while cursor < range.end {
        let chunk_end = range.end.min(cursor + BLOCK_DOWNLOAD_BATCH_SIZE);
        let chunk = service
            .client
            .get_compact_blocks(cursor..chunk_end)
            .await
            .map_err(|e| SyncError::FailedToDownloadBlocks(e.to_string()))?;
        let expected = (u32::from(chunk_end) - u32::from(cursor)) as usize;
        if chunk.len() != expected {
            return Err(SyncError::FailedToDownloadBlocks(format!(
                "Received {} of {} blocks for {}..{}",
                chunk.len(),
                expected,
                cursor,
                chunk_end
            )));
        }
        blocks.extend(chunk);
        cursor = chunk_end;
    }
    Ok(blocks)
}
