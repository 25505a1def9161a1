//! Chain-state verification and reorg repair.

use tracing::{debug, warn};

use crate::client::ChainSource;
use crate::error::SyncError;
use crate::{AccountMeta, BlockHeight, CHAIN_REORG_BLOCK_DELTA};

use super::{SyncObserver, SyncService};

/// Checks that the last scanned block is still on the best chain, rolling the
/// account back to a recent ancestor when it is not.
///
/// A fresh account whose latest scanned block is its birthday is verified like
/// any other; the chain source is expected to serve the birthday tree state.
pub(super) async fn verify_chain_state<C: ChainSource, O: SyncObserver>(
    service: &mut SyncService<C, O>,
    meta: AccountMeta,
) -> Result<(), SyncError> {
    let tip = service
        .client
        .get_latest_block()
        .await
        .map_err(|e| SyncError::FailedToUpdateChainTip(e.to_string()))?;

    if tip < meta.latest_scanned_block {
        // The chain no longer reaches our scanned height, so the scanned
        // suffix is orphaned for certain.
        let anchor = reorg_anchor(tip, meta.birthday);
        warn!(
            account = %service.account_id,
            %tip,
            latest_scanned = %meta.latest_scanned_block,
            %anchor,
            "Chain tip below scanned height, rolling back"
        );
        roll_back(service, anchor).await?;
    } else {
        let state = service
            .client
            .get_tree_state(meta.latest_scanned_block)
            .await
            .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?;
        if state.hash == meta.latest_scanned_block_hash {
            debug!(
                account = %service.account_id,
                height = %meta.latest_scanned_block,
                "Chain state verified"
            );
        } else {
            let anchor = reorg_anchor(meta.latest_scanned_block, meta.birthday);
            warn!(
                account = %service.account_id,
                height = %meta.latest_scanned_block,
                %anchor,
                "Block hash mismatch at scanned height, rolling back"
            );
            roll_back(service, anchor).await?;
        }
    }

    service.verified_tip = Some(tip);
    Ok(())
}

/// Rolls the account back to the anchor height, taking the replacement block
/// hash from the chain source.
async fn roll_back<C: ChainSource, O: SyncObserver>(
    service: &mut SyncService<C, O>,
    anchor: BlockHeight,
) -> Result<(), SyncError> {
    let state = service
        .client
        .get_tree_state(anchor)
        .await
        .map_err(|e| SyncError::FailedToReceiveTreeState(e.to_string()))?;
    service
        .sync_state
        .handle_chain_reorg(service.account_id, anchor, state.hash)
        .map_err(SyncError::FailedToVerifyChainState)?;
    if let Some(meta) = service.account_meta.as_mut() {
        meta.latest_scanned_block = anchor;
        meta.latest_scanned_block_hash = state.hash;
    }
    // The rollback may have removed notes, so the cached set is stale.
    service.spendable_notes = None;
    Ok(())
}

/// The height to resume scanning from after a reorg: a bounded distance below
/// the divergence, never before the account's birthday.
fn reorg_anchor(height: BlockHeight, birthday: BlockHeight) -> BlockHeight {
    birthday.max(height.saturating_sub(CHAIN_REORG_BLOCK_DELTA))
}
