//! *An embeddable synchronization engine for a shielded-pool light client.*
//!
//! `shield_sync` incrementally downloads compact block data from a remote chain
//! source, trial-decrypts it with an account's viewing key to discover received
//! notes and observed spends, and maintains the account's note commitment tree so
//! that spendable notes can later be witnessed. Chain reorganizations up to a fixed
//! depth are detected and repaired automatically.
//!
//! # Design
//!
//! The engine is built around three layers:
//!
//! - [`store::Storage`], an SQLite database holding notes, spend markers, account
//!   metadata, and the shards and checkpoints of the note commitment tree.
//! - [`sync_state::SyncState`], which owns the storage together with one cached
//!   shard-tree manager per account, and applies scan results atomically.
//! - [`sync::SyncService`], a resumable state machine that drives account setup,
//!   chain-state verification, subtree-root refresh, and batched scanning against
//!   a [`client::ChainSource`] implementation supplied by the embedder.
//!
//! The service holds its state exclusively; all database access for an account
//! flows through a single owner, and the CPU-bound scanner runs on a blocking
//! worker. Progress and errors are reported through [`sync::SyncObserver`].
//!
//! ## Feature flags
#![doc = document_features::document_features!()]
//!
// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::fmt;

use uuid::Uuid;

pub mod client;
pub mod error;
pub mod proto;
pub mod scanning;
pub mod serialization;
pub mod store;
pub mod sync;
pub mod sync_state;
pub mod tree;

/// The number of blocks a detected reorganization is assumed not to exceed.
///
/// When the recorded chain state disagrees with the remote, the rollback anchor is
/// placed this many blocks below the disagreement point (never below the account
/// birthday). Reorganizations deeper than this are not detected.
pub const CHAIN_REORG_BLOCK_DELTA: u32 = 150;

/// The number of checkpoints retained in the note commitment tree before older
/// tree state becomes eligible for pruning.
pub(crate) const PRUNING_DEPTH: usize = 100;

/// A unique identifier for a shielded account tracked by the engine.
///
/// The identifier is opaque to the engine; embedders derive it from their own
/// account registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Exposes the account identifier's underlying UUID.
    pub fn expose_uuid(&self) -> Uuid {
        self.0
    }

    /// Generates a fresh random account identifier.
    #[cfg(any(test, feature = "test-dependencies"))]
    pub fn random() -> Self {
        AccountId(Uuid::new_v4())
    }
}

impl From<Uuid> for AccountId {
    fn from(value: Uuid) -> Self {
        AccountId(value)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The height of a block in the chain served by the chain source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHeight(u32);

impl BlockHeight {
    pub const fn from_u32(v: u32) -> Self {
        BlockHeight(v)
    }

    /// Subtracts the provided value from this height, returning height zero if
    /// this would result in underflow of the wrapped value.
    pub const fn saturating_sub(self, v: u32) -> Self {
        BlockHeight(self.0.saturating_sub(v))
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for BlockHeight {
    fn from(value: u32) -> Self {
        BlockHeight(value)
    }
}

impl From<BlockHeight> for u32 {
    fn from(value: BlockHeight) -> Self {
        value.0
    }
}

impl From<BlockHeight> for u64 {
    fn from(value: BlockHeight) -> Self {
        u64::from(value.0)
    }
}

impl TryFrom<u64> for BlockHeight {
    type Error = std::num::TryFromIntError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        u32::try_from(value).map(BlockHeight)
    }
}

impl std::ops::Add<u32> for BlockHeight {
    type Output = BlockHeight;

    fn add(self, other: u32) -> Self::Output {
        BlockHeight(self.0.saturating_add(other))
    }
}

impl std::ops::Sub<u32> for BlockHeight {
    type Output = BlockHeight;

    fn sub(self, other: u32) -> Self::Output {
        BlockHeight(self.0.saturating_sub(other))
    }
}

/// The identifying hash of a chain block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Constructs a block hash from the given slice, returning `None` if the
    /// slice is not exactly 32 bytes long.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(BlockHash)
    }

    /// Parses a block hash from its hexadecimal text form.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s)
            .ok()
            .and_then(|bytes| Self::try_from_slice(&bytes))
    }

    /// Renders this block hash in hexadecimal.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The revealed nullifier of a shielded note.
///
/// A nullifier appears on chain exactly once, when the note it belongs to is
/// spent; it doubles as the stable identifier for notes discovered by scanning.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nullifier(pub [u8; 32]);

impl Nullifier {
    /// Constructs a nullifier from the given slice, returning `None` if the
    /// slice is not exactly 32 bytes long.
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Nullifier)
    }
}

impl fmt::Debug for Nullifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nullifier({})", hex::encode(self.0))
    }
}

/// A shielded note received by the account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Note {
    /// The height of the block in which the note was received.
    pub height: BlockHeight,
    /// The note's value in the smallest unit of the pool's currency.
    pub amount: u64,
    /// The nullifier that will be revealed if this note is ever spent.
    pub nullifier: Nullifier,
}

/// A spend marker observed on chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteSpend {
    /// The height of the block that revealed the nullifier.
    pub height: BlockHeight,
    /// The revealed nullifier.
    pub nullifier: Nullifier,
}

/// Durable per-account synchronization metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountMeta {
    /// The account these records belong to.
    pub account_id: AccountId,
    /// The height from which the account's history begins. Blocks below this
    /// height are never scanned.
    pub birthday: BlockHeight,
    /// The height of the last block whose scan results have been committed.
    /// Never below [`AccountMeta::birthday`].
    pub latest_scanned_block: BlockHeight,
    /// The hash of the block at [`AccountMeta::latest_scanned_block`].
    pub latest_scanned_block_hash: BlockHash,
}
