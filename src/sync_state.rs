//! Coordination of scan results with the durable account state.
//!
//! [`SyncState`] mediates between the scanner's output and [`Storage`]: it
//! filters observed spends down to the account's own notes, feeds discovered
//! note commitments into the account's shard tree, and commits notes, spends,
//! metadata, and tree mutations in a single transaction. It also repairs the
//! stored state after a chain reorganization.

use std::collections::{BTreeMap, BTreeSet};

use incrementalmerkletree::{Address, Level, Position, Retention};
use rusqlite::Transaction;
use shardtree::ShardTree;
use tracing::{debug, info};

use crate::client::{ChainState, SubtreeRoot};
use crate::error::StoreError;
use crate::scanning::ScanResult;
use crate::store::commitment_tree::{self, SqliteShardStore};
use crate::store::{self, Storage};
use crate::tree::{NodeHash, SHARD_HEIGHT, TREE_DEPTH};
use crate::{
    AccountId, AccountMeta, BlockHash, BlockHeight, Note, NoteSpend, Nullifier, PRUNING_DEPTH,
};

type AccountTree<'conn, 'a> = ShardTree<
    SqliteShardStore<&'a Transaction<'conn>, NodeHash, SHARD_HEIGHT>,
    TREE_DEPTH,
    SHARD_HEIGHT,
>;

/// Applies synchronization results to the durable store.
///
/// Owns the [`Storage`] handle; exclusive ownership by the caller serializes
/// all store and tree access for the accounts it manages.
pub struct SyncState {
    storage: Storage,
    tree_managers: BTreeMap<AccountId, ShardTreeManager>,
}

impl SyncState {
    pub fn new(storage: Storage) -> Self {
        SyncState {
            storage,
            tree_managers: BTreeMap::new(),
        }
    }

    /// See [`Storage::register_account`].
    pub fn register_account(
        &mut self,
        account_id: AccountId,
        birthday: BlockHeight,
        birthday_hash: BlockHash,
    ) -> Result<AccountMeta, StoreError> {
        self.storage
            .register_account(account_id, birthday, birthday_hash)
    }

    /// See [`Storage::get_account_meta`].
    pub fn get_account_meta(&self, account_id: AccountId) -> Result<Option<AccountMeta>, StoreError> {
        self.storage.get_account_meta(account_id)
    }

    /// See [`Storage::get_spendable_notes`].
    pub fn get_spendable_notes(&self, account_id: AccountId) -> Result<Vec<Note>, StoreError> {
        self.storage.get_spendable_notes(account_id)
    }

    /// See [`Storage::get_nullifiers`].
    pub fn get_nullifiers(&self, account_id: AccountId) -> Result<Vec<NoteSpend>, StoreError> {
        self.storage.get_nullifiers(account_id)
    }

    /// Returns the index of the highest subtree for which any data is stored.
    pub fn latest_shard_index(&self, account_id: AccountId) -> Result<Option<u64>, StoreError> {
        commitment_tree::get_latest_shard_index(self.storage.conn(), account_id)
            .map_err(StoreError::from)
    }

    /// Commits the results of scanning one block range.
    ///
    /// Observed spends are filtered to those matching a nullifier of an
    /// existing or newly discovered note; everything else in the result is
    /// foreign to the account. Notes, filtered spends, the advanced scan
    /// metadata, and the tree insertions land in one transaction.
    pub fn update_notes(
        &mut self,
        account_id: AccountId,
        result: ScanResult,
        new_height: BlockHeight,
        new_hash: BlockHash,
    ) -> Result<(), StoreError> {
        let SyncState {
            storage,
            tree_managers,
        } = self;
        let manager = tree_managers
            .entry(account_id)
            .or_insert_with(|| ShardTreeManager::new(account_id));

        let tx = storage.transaction()?;

        let mut known_nullifiers: BTreeSet<Nullifier> =
            store::get_spendable_notes(&tx, account_id)?
                .into_iter()
                .map(|note| note.nullifier)
                .collect();
        known_nullifiers.extend(result.received_notes().iter().map(|note| note.nullifier));

        let spends: Vec<NoteSpend> = result
            .spends()
            .iter()
            .filter(|spend| known_nullifiers.contains(&spend.nullifier))
            .copied()
            .collect();

        let notes = result.received_notes().to_vec();
        let (chain_state, commitments) = result.into_commitments();

        manager.insert_commitments(&tx, &chain_state, commitments)?;
        store::insert_notes(&tx, account_id, &notes)?;
        store::insert_spends(&tx, account_id, &spends)?;
        store::update_latest_scanned_block(&tx, account_id, new_height, new_hash)?;
        tx.commit()?;

        debug!(
            account = %account_id,
            height = %new_height,
            notes = notes.len(),
            spends = spends.len(),
            "Committed scan results"
        );
        Ok(())
    }

    /// Rolls the account back to the given height after a reorg.
    ///
    /// Notes and spends discovered above the height are deleted, the
    /// commitment tree loses the checkpoint at the height together with all
    /// later checkpoints and any tree state beyond it, and the scan metadata
    /// is reset, all in one transaction. Subsequent scans re-checkpoint the
    /// rewritten blocks cleanly.
    pub fn handle_chain_reorg(
        &mut self,
        account_id: AccountId,
        height: BlockHeight,
        hash: BlockHash,
    ) -> Result<(), StoreError> {
        let SyncState {
            storage,
            tree_managers,
        } = self;
        let manager = tree_managers
            .entry(account_id)
            .or_insert_with(|| ShardTreeManager::new(account_id));

        let tx = storage.transaction()?;
        store::delete_notes_above(&tx, account_id, height)?;
        manager.truncate_to_height(&tx, height)?;
        store::update_latest_scanned_block(&tx, account_id, height, hash)?;
        tx.commit()?;

        info!(account = %account_id, %height, "Rolled back to common ancestor");
        Ok(())
    }

    /// Stores a contiguous page of completed subtree roots beginning at
    /// `start_index`.
    pub fn update_subtree_roots(
        &mut self,
        account_id: AccountId,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), StoreError> {
        let tx = self.storage.transaction()?;
        commitment_tree::put_shard_roots(&tx, account_id, start_index, roots)?;
        tx.commit()?;

        debug!(
            account = %account_id,
            start_index,
            count = roots.len(),
            "Stored subtree roots"
        );
        Ok(())
    }
}

/// Drives one account's shard tree over store transactions.
///
/// [`ShardTree`] takes ownership of its backing store, so a fresh tree is
/// constructed over each transaction; the manager carries the retention
/// configuration between uses and is cached for the life of the sync state.
struct ShardTreeManager {
    account_id: AccountId,
    max_checkpoints: usize,
}

impl ShardTreeManager {
    fn new(account_id: AccountId) -> Self {
        ShardTreeManager {
            account_id,
            max_checkpoints: PRUNING_DEPTH,
        }
    }

    /// Inserts the prior chain-state frontier, when one exists, followed by
    /// the scanned note commitments at the chain state's end position.
    fn insert_commitments(
        &self,
        conn: &Transaction<'_>,
        chain_state: &ChainState,
        commitments: Vec<(NodeHash, Retention<BlockHeight>)>,
    ) -> Result<(), StoreError> {
        let mut tree = AccountTree::new(
            SqliteShardStore::from_connection(conn, self.account_id),
            self.max_checkpoints,
        );

        if let Some(frontier) = chain_state.final_tree().value() {
            tree.insert_frontier_nodes(
                frontier.clone(),
                Retention::Checkpoint {
                    id: chain_state.block_height(),
                    is_marked: false,
                },
            )?;
        }

        if !commitments.is_empty() {
            tree.batch_insert(
                Position::from(chain_state.tree_size()),
                commitments.into_iter(),
            )?;
        }

        Ok(())
    }

    /// Discards all checkpoints and tree state above the given height.
    fn truncate_to_height(
        &self,
        conn: &Transaction<'_>,
        height: BlockHeight,
    ) -> Result<(), StoreError> {
        match commitment_tree::max_checkpoint_id_at_or_below(conn, self.account_id, height)? {
            Some(checkpoint_id) => {
                let mut tree = AccountTree::new(
                    SqliteShardStore::from_connection(conn, self.account_id),
                    self.max_checkpoints,
                );
                if !tree.truncate_removing_checkpoint(&checkpoint_id)? {
                    return Err(StoreError::NoCheckpoints(checkpoint_id));
                }
            }
            None => {
                // Nothing checkpointed survives the rollback; drop the tree
                // outright and let the next scan's frontier insert rebuild it.
                commitment_tree::truncate(
                    conn,
                    self.account_id,
                    Address::from_parts(Level::from(SHARD_HEIGHT), 0),
                )?;
                commitment_tree::truncate_checkpoints(
                    conn,
                    self.account_id,
                    BlockHeight::from_u32(0),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use incrementalmerkletree::frontier::Frontier;
    use tempfile::NamedTempFile;

    use super::SyncState;
    use crate::client::{ChainState, SubtreeRoot};
    use crate::scanning::testing::{
        fake_block_hash, fake_compact_block, fake_decryptable_action, fake_foreign_action,
    };
    use crate::scanning::{scan_blocks, ScanResult, ScanningKey};
    use crate::store::{commitment_tree, Storage};
    use crate::tree::{NodeHash, TREE_DEPTH};
    use crate::{AccountId, BlockHash, BlockHeight};

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    fn test_state() -> (NamedTempFile, SyncState) {
        let file = NamedTempFile::new().unwrap();
        let state = SyncState::new(Storage::for_path(file.path()).unwrap());
        (file, state)
    }

    fn test_key() -> ScanningKey {
        ScanningKey::from_parts([7u8; 32], [11u8; 32])
    }

    fn frontier_of(leaves: &[NodeHash]) -> Frontier<NodeHash, TREE_DEPTH> {
        let mut frontier = Frontier::empty();
        for leaf in leaves {
            assert!(frontier.append(*leaf));
        }
        frontier
    }

    /// Scans block 101 (one foreign action, one note of 70 000 for `key`)
    /// against an empty tree state at height 100.
    fn scan_first_block(key: &ScanningKey) -> ScanResult {
        let (own_action, _) = fake_decryptable_action(key, 70_000, 3);
        let block = fake_compact_block(
            h(101),
            fake_block_hash(h(100)),
            vec![fake_foreign_action(9), own_action],
            Some(2),
        );
        let prior = ChainState::from_parts(h(100), fake_block_hash(h(100)), Frontier::empty());
        scan_blocks(key, prior, vec![block]).unwrap()
    }

    #[test]
    fn update_notes_persists_results() {
        let (_file, mut state) = test_state();
        let account = AccountId::random();
        state
            .register_account(account, h(100), fake_block_hash(h(100)))
            .unwrap();

        let key = test_key();
        let result = scan_first_block(&key);
        let new_height = result.last_scanned_height();
        let new_hash = result.last_scanned_hash();
        state
            .update_notes(account, result, new_height, new_hash)
            .unwrap();

        let notes = state.get_spendable_notes(account).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].amount, 70_000);
        assert_eq!(notes[0].height, h(101));

        // The block's nullifier fields match no known note, so no spend rows.
        assert!(state.get_nullifiers(account).unwrap().is_empty());

        let meta = state.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned_block, h(101));
        assert_eq!(meta.latest_scanned_block_hash, fake_block_hash(h(101)));

        // Both commitments landed in shard 0 with the block checkpointed.
        assert_eq!(state.latest_shard_index(account).unwrap(), Some(0));
        assert_eq!(
            commitment_tree::checkpoint_count(state.storage.conn(), account).unwrap(),
            1
        );
        assert_eq!(
            commitment_tree::max_checkpoint_id(state.storage.conn(), account).unwrap(),
            Some(h(101))
        );
    }

    #[test]
    fn update_notes_records_spends_of_own_notes() {
        let (_file, mut state) = test_state();
        let account = AccountId::random();
        state
            .register_account(account, h(100), fake_block_hash(h(100)))
            .unwrap();

        let key = test_key();
        let result = scan_first_block(&key);
        let leaves: Vec<NodeHash> = result
            .note_commitments()
            .iter()
            .map(|(leaf, _)| *leaf)
            .collect();
        state
            .update_notes(account, result, h(101), fake_block_hash(h(101)))
            .unwrap();
        let own_nullifier = state.get_spendable_notes(account).unwrap()[0].nullifier;

        // Block 102 spends the note; a second foreign nullifier goes with it.
        let mut spend_action = fake_foreign_action(21);
        spend_action.nullifier = own_nullifier.0.to_vec();
        let block = fake_compact_block(
            h(102),
            fake_block_hash(h(101)),
            vec![spend_action, fake_foreign_action(33)],
            Some(4),
        );
        let prior = ChainState::from_parts(h(101), fake_block_hash(h(101)), frontier_of(&leaves));
        let result = scan_blocks(&key, prior, vec![block]).unwrap();
        state
            .update_notes(account, result, h(102), fake_block_hash(h(102)))
            .unwrap();

        assert!(state.get_spendable_notes(account).unwrap().is_empty());
        let spends = state.get_nullifiers(account).unwrap();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].height, h(102));
        assert_eq!(spends[0].nullifier, own_nullifier);
    }

    #[test]
    fn reorg_rolls_back_notes_and_checkpoints() {
        let (_file, mut state) = test_state();
        let account = AccountId::random();
        state
            .register_account(account, h(100), fake_block_hash(h(100)))
            .unwrap();

        let key = test_key();
        let result = scan_first_block(&key);
        let leaves: Vec<NodeHash> = result
            .note_commitments()
            .iter()
            .map(|(leaf, _)| *leaf)
            .collect();
        state
            .update_notes(account, result, h(101), fake_block_hash(h(101)))
            .unwrap();

        // Block 102 carries a second note that the reorg will orphan.
        let (own_action, _) = fake_decryptable_action(&key, 12_000, 5);
        let block = fake_compact_block(h(102), fake_block_hash(h(101)), vec![own_action], Some(3));
        let prior = ChainState::from_parts(h(101), fake_block_hash(h(101)), frontier_of(&leaves));
        let result = scan_blocks(&key, prior, vec![block]).unwrap();
        state
            .update_notes(account, result, h(102), fake_block_hash(h(102)))
            .unwrap();
        assert_eq!(state.get_spendable_notes(account).unwrap().len(), 2);

        let replacement_hash = BlockHash([0xcc; 32]);
        state
            .handle_chain_reorg(account, h(101), replacement_hash)
            .unwrap();

        let notes = state.get_spendable_notes(account).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].height, h(101));
        let meta = state.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned_block, h(101));
        assert_eq!(meta.latest_scanned_block_hash, replacement_hash);

        // The rollback checkpoint and everything later are gone.
        assert_eq!(
            commitment_tree::checkpoint_count(state.storage.conn(), account).unwrap(),
            0
        );

        // The replacement block re-checkpoints without conflict.
        let block = fake_compact_block(
            h(102),
            replacement_hash,
            vec![fake_foreign_action(40)],
            Some(3),
        );
        let prior = ChainState::from_parts(h(101), replacement_hash, frontier_of(&leaves));
        let result = scan_blocks(&key, prior, vec![block]).unwrap();
        state
            .update_notes(account, result, h(102), fake_block_hash(h(102)))
            .unwrap();
        assert_eq!(
            commitment_tree::max_checkpoint_id(state.storage.conn(), account).unwrap(),
            Some(h(102))
        );
    }

    #[test]
    fn reorg_below_all_checkpoints_drops_the_tree() {
        let (_file, mut state) = test_state();
        let account = AccountId::random();
        state
            .register_account(account, h(100), fake_block_hash(h(100)))
            .unwrap();

        let key = test_key();
        let result = scan_first_block(&key);
        state
            .update_notes(account, result, h(101), fake_block_hash(h(101)))
            .unwrap();
        assert_eq!(state.latest_shard_index(account).unwrap(), Some(0));

        state
            .handle_chain_reorg(account, h(100), fake_block_hash(h(100)))
            .unwrap();

        assert!(state.get_spendable_notes(account).unwrap().is_empty());
        assert_eq!(state.latest_shard_index(account).unwrap(), None);
        assert_eq!(
            commitment_tree::checkpoint_count(state.storage.conn(), account).unwrap(),
            0
        );
        assert_eq!(
            state.get_account_meta(account).unwrap().unwrap().latest_scanned_block,
            h(100)
        );
    }

    #[test]
    fn subtree_roots_extend_the_stored_range() {
        let (_file, mut state) = test_state();
        let account = AccountId::random();

        state
            .update_subtree_roots(
                account,
                0,
                &[
                    SubtreeRoot::from_parts(h(150), NodeHash::from_bytes([1; 32])),
                    SubtreeRoot::from_parts(h(160), NodeHash::from_bytes([2; 32])),
                ],
            )
            .unwrap();
        assert_eq!(state.latest_shard_index(account).unwrap(), Some(1));

        state
            .update_subtree_roots(
                account,
                2,
                &[SubtreeRoot::from_parts(h(170), NodeHash::from_bytes([3; 32]))],
            )
            .unwrap();
        assert_eq!(state.latest_shard_index(account).unwrap(), Some(2));
    }
}
