//! The synchronization service.
//!
//! [`SyncService`] drives one account through a linear pipeline: account
//! resolution, chain-state verification, subtree-root refresh, spendable-note
//! refresh, and batched block scanning. [`SyncService::run`] re-enters the
//! pipeline dispatch from the top after every completed step (a trampoline
//! rather than recursion), so stop requests and errors take effect between
//! steps rather than interrupting one.

mod scan_blocks;
mod subtree_roots;
mod verify_chain;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use secrecy::SecretVec;
use tokio::task;
use tracing::{debug, error, info};

use crate::client::ChainSource;
use crate::error::SyncError;
use crate::scanning::{DecoderError, ScanningKey};
use crate::sync_state::SyncState;
use crate::{AccountId, AccountMeta, BlockHash, BlockHeight, Note};

use scan_blocks::ScanBlocksTask;

/// Receives lifecycle and progress callbacks from a [`SyncService`].
///
/// Callbacks run on the service's task; implementations should hand work off
/// rather than block.
pub trait SyncObserver {
    /// The service has started processing.
    fn on_sync_start(&mut self, account_id: AccountId);
    /// The spendable note set changed or a scan range committed.
    fn on_sync_status_update(&mut self, account_id: AccountId, status: SyncStatus);
    /// A failure ended the run. Fires at most once, before the stop callback.
    fn on_sync_error(&mut self, account_id: AccountId, error: &SyncError);
    /// The service will do no further work. Fires exactly once per run.
    fn on_sync_stop(&mut self, account_id: AccountId);
}

/// A progress snapshot published to the observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    /// First block of the scan window. Equal to `end` until the window has
    /// been computed.
    pub start: BlockHeight,
    /// One past the last block of the scan window.
    pub end: BlockHeight,
    /// Number of ranges the window was split into.
    pub total_ranges: usize,
    /// Ranges committed so far.
    pub ready_ranges: usize,
    /// Spendable notes currently known.
    pub note_count: usize,
    /// Sum of the spendable note amounts.
    pub balance: u64,
}

/// A cloneable handle for stopping a running [`SyncService`].
#[derive(Clone)]
pub struct SyncHandle {
    stop: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Requests that the service stop at its next dispatch. At most one
    /// already-dispatched step completes after the request.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Synchronizes one account against a [`ChainSource`].
pub struct SyncService<C, O> {
    client: C,
    sync_state: SyncState,
    observer: O,
    account_id: AccountId,
    birthday: BlockHeight,
    birthday_hash: BlockHash,
    key: ScanningKey,
    stop: Arc<AtomicBool>,
    error: Option<SyncError>,
    finished: bool,
    account_meta: Option<AccountMeta>,
    verified_tip: Option<BlockHeight>,
    subtree_roots_updated: bool,
    spendable_notes: Option<Vec<Note>>,
    scan_task: Option<ScanBlocksTask>,
}

impl<C: ChainSource, O: SyncObserver> SyncService<C, O> {
    /// Creates a service for the given account.
    ///
    /// `key_bytes` holds the account's scanning key in the layout accepted by
    /// [`ScanningKey::from_bytes`]. The birthday height and hash are used to
    /// register the account if the store does not know it yet.
    pub fn new(
        client: C,
        sync_state: SyncState,
        observer: O,
        account_id: AccountId,
        birthday: BlockHeight,
        birthday_hash: BlockHash,
        key_bytes: &SecretVec<u8>,
    ) -> Result<Self, DecoderError> {
        let key = ScanningKey::from_bytes(key_bytes)?;
        Ok(SyncService {
            client,
            sync_state,
            observer,
            account_id,
            birthday,
            birthday_hash,
            key,
            stop: Arc::new(AtomicBool::new(false)),
            error: None,
            finished: false,
            account_meta: None,
            verified_tip: None,
            subtree_roots_updated: false,
            spendable_notes: None,
            scan_task: None,
        })
    }

    /// Returns a handle that can stop this service from another task.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            stop: self.stop.clone(),
        }
    }

    /// Runs the pipeline until every scan range has committed, a failure
    /// occurs, or a stop is requested.
    ///
    /// The observer sees the start callback once, a status update after each
    /// note refresh and committed range, the error callback at most once, and
    /// the stop callback exactly once as the final event.
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.observer.on_sync_start(self.account_id);
        info!(account = %self.account_id, "Sync started");

        let result = loop {
            if self.stop.load(Ordering::Relaxed) {
                info!(account = %self.account_id, "Sync stopped on request");
                break Ok(());
            }
            if let Some(e) = self.error.take() {
                self.observer.on_sync_error(self.account_id, &e);
                break Err(e);
            }
            if self.finished {
                info!(account = %self.account_id, "Sync finished");
                break Ok(());
            }

            if let Err(e) = self.work_on_task().await {
                error!(account = %self.account_id, error = %e, "Sync step failed");
                self.error = Some(e);
            }
            task::yield_now().await;
        };

        self.observer.on_sync_stop(self.account_id);
        result
    }

    /// Dispatches the next pipeline step. Earlier stages are skipped once
    /// satisfied, so each call advances exactly one stage.
    async fn work_on_task(&mut self) -> Result<(), SyncError> {
        let meta = match self.account_meta {
            None => return self.resolve_account(),
            Some(meta) => meta,
        };
        let tip = match self.verified_tip {
            None => return verify_chain::verify_chain_state(self, meta).await,
            Some(tip) => tip,
        };
        if !self.subtree_roots_updated {
            return subtree_roots::update_subtree_roots(self).await;
        }
        if self.spendable_notes.is_none() {
            return self.refresh_spendable_notes(meta);
        }
        scan_blocks::scan_next_range(self, meta, tip).await
    }

    /// Loads the account's metadata, registering the account at its birthday
    /// on first contact.
    fn resolve_account(&mut self) -> Result<(), SyncError> {
        let meta = self
            .sync_state
            .get_account_meta(self.account_id)
            .map_err(SyncError::FailedToRetrieveAccount)?;
        let meta = match meta {
            Some(meta) => meta,
            None => {
                info!(
                    account = %self.account_id,
                    birthday = %self.birthday,
                    "Registering account"
                );
                self.sync_state
                    .register_account(self.account_id, self.birthday, self.birthday_hash)
                    .map_err(SyncError::FailedToInitAccount)?
            }
        };
        self.account_meta = Some(meta);
        Ok(())
    }

    /// Reloads the spendable note set and publishes the account balance.
    fn refresh_spendable_notes(&mut self, meta: AccountMeta) -> Result<(), SyncError> {
        let notes = self
            .sync_state
            .get_spendable_notes(self.account_id)
            .map_err(SyncError::FailedToRetrieveSpendableNotes)?;

        let next_height = meta.latest_scanned_block + 1;
        let status = SyncStatus {
            start: next_height,
            end: next_height,
            total_ranges: 0,
            ready_ranges: 0,
            note_count: notes.len(),
            balance: notes.iter().map(|note| note.amount).sum(),
        };
        debug!(
            account = %self.account_id,
            notes = status.note_count,
            balance = status.balance,
            "Loaded spendable notes"
        );
        self.spendable_notes = Some(notes);
        self.observer.on_sync_status_update(self.account_id, status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use incrementalmerkletree::frontier::Frontier;
    use secrecy::SecretVec;
    use tempfile::NamedTempFile;

    use super::{SyncObserver, SyncService, SyncStatus};
    use crate::client::testing::{tree_state_from_frontier, MockChainSource};
    use crate::error::SyncError;
    use crate::proto::CompactAction;
    use crate::scanning::testing::{
        fake_block_hash, fake_compact_block, fake_decryptable_action, fake_foreign_action,
    };
    use crate::scanning::ScanningKey;
    use crate::store::Storage;
    use crate::sync_state::SyncState;
    use crate::tree::{NodeHash, TREE_DEPTH};
    use crate::{AccountId, BlockHash, BlockHeight};

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    fn test_key() -> ScanningKey {
        ScanningKey::from_parts([7u8; 32], [11u8; 32])
    }

    fn test_key_bytes() -> SecretVec<u8> {
        let mut bytes = vec![7u8; 32];
        bytes.extend_from_slice(&[11u8; 32]);
        SecretVec::new(bytes)
    }

    #[derive(Clone, Default)]
    struct RecordingObserver {
        events: Arc<Mutex<Events>>,
    }

    #[derive(Default)]
    struct Events {
        started: usize,
        stopped: usize,
        errors: Vec<String>,
        statuses: Vec<SyncStatus>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            Self::default()
        }

        fn started(&self) -> usize {
            self.events.lock().unwrap().started
        }

        fn stopped(&self) -> usize {
            self.events.lock().unwrap().stopped
        }

        fn errors(&self) -> Vec<String> {
            self.events.lock().unwrap().errors.clone()
        }

        fn statuses(&self) -> Vec<SyncStatus> {
            self.events.lock().unwrap().statuses.clone()
        }
    }

    impl SyncObserver for RecordingObserver {
        fn on_sync_start(&mut self, _account_id: AccountId) {
            self.events.lock().unwrap().started += 1;
        }

        fn on_sync_status_update(&mut self, _account_id: AccountId, status: SyncStatus) {
            self.events.lock().unwrap().statuses.push(status);
        }

        fn on_sync_error(&mut self, _account_id: AccountId, error: &SyncError) {
            self.events.lock().unwrap().errors.push(error.to_string());
        }

        fn on_sync_stop(&mut self, _account_id: AccountId) {
            self.events.lock().unwrap().stopped += 1;
        }
    }

    /// A simulated chain that keeps the mock's tree states consistent with
    /// the blocks it serves.
    struct TestChain {
        source: MockChainSource,
        frontier: Frontier<NodeHash, TREE_DEPTH>,
        height: BlockHeight,
        tip_hash: BlockHash,
        tree_size: u32,
        fork: u8,
    }

    #[derive(Clone)]
    struct ChainSnapshot {
        frontier: Frontier<NodeHash, TREE_DEPTH>,
        height: BlockHeight,
        tip_hash: BlockHash,
        tree_size: u32,
    }

    impl TestChain {
        /// Starts a chain whose tree is empty at the given height.
        fn new(height: BlockHeight) -> Self {
            let source = MockChainSource::new();
            let frontier = Frontier::empty();
            let tip_hash = fake_block_hash(height);
            source.add_tree_state(tree_state_from_frontier(height, tip_hash, &frontier));
            source.set_latest_block(height);
            TestChain {
                source,
                frontier,
                height,
                tip_hash,
                tree_size: 0,
                fork: 0,
            }
        }

        fn block_hash(&self, height: BlockHeight) -> BlockHash {
            let mut hash = fake_block_hash(height).0;
            hash[0] ^= self.fork;
            BlockHash(hash)
        }

        /// Appends a block of the given actions at the next height, recording
        /// the block, its end-of-block tree state, and the new tip.
        fn push_block(&mut self, actions: Vec<CompactAction>) {
            let height = self.height + 1;
            for action in &actions {
                let mut cmx = [0u8; 32];
                cmx.copy_from_slice(&action.cmx);
                assert!(self.frontier.append(NodeHash::from_bytes(cmx)));
                self.tree_size += 1;
            }

            let hash = self.block_hash(height);
            let mut block =
                fake_compact_block(height, self.tip_hash, actions, Some(self.tree_size));
            block.hash = hash.0.to_vec();
            self.source.add_block(block);
            self.source
                .add_tree_state(tree_state_from_frontier(height, hash, &self.frontier));
            self.source.set_latest_block(height);
            self.height = height;
            self.tip_hash = hash;
        }

        fn snapshot(&self) -> ChainSnapshot {
            ChainSnapshot {
                frontier: self.frontier.clone(),
                height: self.height,
                tip_hash: self.tip_hash,
                tree_size: self.tree_size,
            }
        }

        /// Rewinds to the snapshot and switches to a fork whose block hashes
        /// differ from the original chain's.
        fn rewind(&mut self, snapshot: ChainSnapshot, fork: u8) {
            self.source.rollback_blocks(snapshot.height + 1);
            self.source.set_latest_block(snapshot.height);
            self.frontier = snapshot.frontier;
            self.height = snapshot.height;
            self.tip_hash = snapshot.tip_hash;
            self.tree_size = snapshot.tree_size;
            self.fork = fork;
        }
    }

    fn test_service(
        chain: &TestChain,
        file: &NamedTempFile,
        observer: RecordingObserver,
        account: AccountId,
        birthday: BlockHeight,
    ) -> SyncService<MockChainSource, RecordingObserver> {
        let storage = Storage::for_path(file.path()).unwrap();
        SyncService::new(
            chain.source.clone(),
            SyncState::new(storage),
            observer,
            account,
            birthday,
            fake_block_hash(birthday),
            &test_key_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sync_from_birthday_discovers_notes() {
        let mut chain = TestChain::new(h(100));
        let key = test_key();
        let (own_a, _) = fake_decryptable_action(&key, 70_000, 3);
        chain.push_block(vec![fake_foreign_action(9), own_a]);
        let (own_b, _) = fake_decryptable_action(&key, 12_000, 5);
        chain.push_block(vec![own_b]);

        let observer = RecordingObserver::new();
        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        let service = test_service(&chain, &file, observer.clone(), account, h(100));
        service.run().await.unwrap();

        assert_eq!(observer.started(), 1);
        assert_eq!(observer.stopped(), 1);
        assert!(observer.errors().is_empty());

        // One status from the note refresh, one per committed range.
        let statuses = observer.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].note_count, 0);
        assert_eq!(statuses[0].balance, 0);
        let last = statuses.last().unwrap();
        assert_eq!(last.start, h(101));
        assert_eq!(last.end, h(103));
        assert_eq!(last.total_ranges, 1);
        assert_eq!(last.ready_ranges, 1);
        assert_eq!(last.note_count, 2);
        assert_eq!(last.balance, 82_000);

        let storage = Storage::for_path(file.path()).unwrap();
        let notes = storage.get_spendable_notes(account).unwrap();
        assert_eq!(notes.len(), 2);
        let meta = storage.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned_block, h(102));
        assert_eq!(meta.latest_scanned_block_hash, chain.tip_hash);
    }

    #[tokio::test]
    async fn resync_at_tip_does_no_scanning() {
        let mut chain = TestChain::new(h(100));
        let key = test_key();
        let (own_a, _) = fake_decryptable_action(&key, 70_000, 3);
        chain.push_block(vec![own_a]);

        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        let first = RecordingObserver::new();
        test_service(&chain, &file, first.clone(), account, h(100))
            .run()
            .await
            .unwrap();
        assert_eq!(first.statuses().len(), 2);

        // Nothing new on chain, so the second run only refreshes notes.
        let second = RecordingObserver::new();
        test_service(&chain, &file, second.clone(), account, h(100))
            .run()
            .await
            .unwrap();
        assert!(second.errors().is_empty());
        let statuses = second.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].total_ranges, 0);
        assert_eq!(statuses[0].note_count, 1);
        assert_eq!(statuses[0].balance, 70_000);
    }

    #[tokio::test]
    async fn reorg_replaces_orphaned_notes() {
        let mut chain = TestChain::new(h(100));
        let key = test_key();
        let (own_a, _) = fake_decryptable_action(&key, 70_000, 3);
        chain.push_block(vec![own_a]);
        let fork_point = chain.snapshot();
        let (own_b, _) = fake_decryptable_action(&key, 12_000, 5);
        chain.push_block(vec![own_b]);

        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        let first = RecordingObserver::new();
        test_service(&chain, &file, first.clone(), account, h(100))
            .run()
            .await
            .unwrap();
        assert!(first.errors().is_empty());

        // The chain replaces block 102 and extends to 103; the note from the
        // orphaned block 102 must disappear and the new one appear.
        chain.rewind(fork_point, 1);
        chain.push_block(vec![fake_foreign_action(40)]);
        let (own_c, _) = fake_decryptable_action(&key, 30_000, 6);
        chain.push_block(vec![own_c]);

        let second = RecordingObserver::new();
        test_service(&chain, &file, second.clone(), account, h(100))
            .run()
            .await
            .unwrap();
        assert!(second.errors().is_empty());

        let storage = Storage::for_path(file.path()).unwrap();
        let notes = storage.get_spendable_notes(account).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].height, h(101));
        assert_eq!(notes[0].amount, 70_000);
        assert_eq!(notes[1].height, h(103));
        assert_eq!(notes[1].amount, 30_000);
        let meta = storage.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned_block, h(103));
        assert_eq!(meta.latest_scanned_block_hash, chain.tip_hash);

        let last = second.statuses().last().cloned().unwrap();
        assert_eq!(last.note_count, 2);
        assert_eq!(last.balance, 100_000);
    }

    #[tokio::test]
    async fn stop_request_precedes_any_work() {
        let mut chain = TestChain::new(h(100));
        let key = test_key();
        let (own_a, _) = fake_decryptable_action(&key, 70_000, 3);
        chain.push_block(vec![own_a]);

        let observer = RecordingObserver::new();
        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        let service = test_service(&chain, &file, observer.clone(), account, h(100));
        let handle = service.handle();
        handle.request_stop();
        service.run().await.unwrap();

        assert_eq!(observer.started(), 1);
        assert_eq!(observer.stopped(), 1);
        assert!(observer.statuses().is_empty());
        assert!(observer.errors().is_empty());

        // The stop arrived before account resolution ran.
        let storage = Storage::for_path(file.path()).unwrap();
        assert_eq!(storage.get_account_meta(account).unwrap(), None);
    }

    #[tokio::test]
    async fn chain_failure_is_sticky_and_reported_once() {
        // A mock with no chain tip fails the verification step.
        let source = MockChainSource::new();
        let observer = RecordingObserver::new();
        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        let storage = Storage::for_path(file.path()).unwrap();
        let service = SyncService::new(
            source,
            SyncState::new(storage),
            observer.clone(),
            account,
            h(100),
            fake_block_hash(h(100)),
            &test_key_bytes(),
        )
        .unwrap();

        assert_matches!(
            service.run().await,
            Err(SyncError::FailedToUpdateChainTip(_))
        );
        assert_eq!(observer.errors().len(), 1);
        assert_eq!(observer.started(), 1);
        assert_eq!(observer.stopped(), 1);
        assert!(observer.statuses().is_empty());

        // Account resolution had already committed before the failure.
        let storage = Storage::for_path(file.path()).unwrap();
        assert!(storage.get_account_meta(account).unwrap().is_some());
    }

    #[test]
    fn invalid_key_is_rejected_at_construction() {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::for_path(file.path()).unwrap();
        let result = SyncService::new(
            MockChainSource::new(),
            SyncState::new(storage),
            RecordingObserver::new(),
            AccountId::random(),
            h(100),
            fake_block_hash(h(100)),
            &SecretVec::new(vec![0u8; 63]),
        );
        assert!(result.is_err());
    }
}
