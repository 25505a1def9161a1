//! Subtree-root refresh.
//!
//! Roots of completed subtrees published by the chain source let the shard
//! tree represent fully-scanned history as single pruned nodes instead of
//! rebuilding it leaf by leaf.

use tracing::debug;

use crate::client::ChainSource;
use crate::error::SyncError;

use super::{SyncObserver, SyncService};

/// How many subtree roots to request per round trip.
const SUBTREE_ROOTS_BATCH_SIZE: usize = 1024;

/// Downloads every completed subtree root the store does not yet have and
/// installs them as pruned shards.
pub(super) async fn update_subtree_roots<C: ChainSource, O: SyncObserver>(
    service: &mut SyncService<C, O>,
) -> Result<(), SyncError> {
    let mut start_index = service
        .sync_state
        .latest_shard_index(service.account_id)
        .map_err(|e| SyncError::FailedToUpdateSubtreeRoots(e.to_string()))?
        .map_or(0, |index| index + 1);

    loop {
        let roots = service
            .client
            .get_subtree_roots(start_index, SUBTREE_ROOTS_BATCH_SIZE)
            .await
            .map_err(|e| SyncError::FailedToUpdateSubtreeRoots(e.to_string()))?;
        if roots.is_empty() {
            break;
        }
        let count = roots.len();
        service
            .sync_state
            .update_subtree_roots(service.account_id, start_index, &roots)
            .map_err(|e| SyncError::FailedToUpdateSubtreeRoots(e.to_string()))?;
        debug!(
            account = %service.account_id,
            start_index,
            count,
            "Stored subtree roots"
        );
        if count < SUBTREE_ROOTS_BATCH_SIZE {
            break;
        }
        start_index += count as u64;
    }

    service.subtree_roots_updated = true;
    Ok(())
}
