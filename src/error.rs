//! Error types for the store and service layers.

use std::fmt;

use shardtree::error::ShardTreeError;

use crate::store::commitment_tree;
use crate::{AccountId, BlockHeight};

/// Errors that can occur in the persistent store.
#[derive(Debug)]
pub enum StoreError {
    /// The database schema could not be created or migrated.
    DbInit(rusqlite::Error),
    /// The database reports a schema version newer than this library understands.
    UnsupportedSchemaVersion(u32),
    /// An error occurred executing a SQLite statement.
    Query(rusqlite::Error),
    /// A stored value was outside the representable range of its in-memory type.
    Format(String),
    /// Stored data violates an invariant of the data model.
    Consistency(String),
    /// The requested account is not registered.
    AccountNotFound(AccountId),
    /// An account with the given identifier is already registered.
    AccountAlreadyRegistered(AccountId),
    /// A tree rollback required a checkpoint that is not recorded.
    NoCheckpoints(BlockHeight),
    /// An error occurred in the note commitment tree store.
    CommitmentTree(ShardTreeError<commitment_tree::Error>),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DbInit(e) => {
                write!(f, "The database could not be initialized: {}", e)
            }
            StoreError::UnsupportedSchemaVersion(v) => {
                write!(f, "The database schema version {} is not supported", v)
            }
            StoreError::Query(e) => {
                write!(f, "An error occurred executing a database statement: {}", e)
            }
            StoreError::Format(msg) => {
                write!(f, "A stored value was malformed: {}", msg)
            }
            StoreError::Consistency(msg) => {
                write!(f, "Stored data is inconsistent: {}", msg)
            }
            StoreError::AccountNotFound(account_id) => {
                write!(f, "Account {} is not registered", account_id)
            }
            StoreError::AccountAlreadyRegistered(account_id) => {
                write!(f, "Account {} is already registered", account_id)
            }
            StoreError::NoCheckpoints(height) => {
                write!(f, "No checkpoint is recorded at height {}", height)
            }
            StoreError::CommitmentTree(e) => {
                write!(f, "An error occurred in the note commitment tree: {}", e)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::DbInit(e) => Some(e),
            StoreError::Query(e) => Some(e),
            StoreError::CommitmentTree(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query(e)
    }
}

impl From<ShardTreeError<commitment_tree::Error>> for StoreError {
    fn from(e: ShardTreeError<commitment_tree::Error>) -> Self {
        StoreError::CommitmentTree(e)
    }
}

impl From<commitment_tree::Error> for StoreError {
    fn from(e: commitment_tree::Error) -> Self {
        StoreError::CommitmentTree(ShardTreeError::Storage(e))
    }
}

/// Errors reported by the synchronization service.
///
/// Every variant is terminal for the sync attempt that produced it: the service
/// reports it to the observer and stops.
#[derive(Debug)]
pub enum SyncError {
    /// The chain tip height could not be fetched from the chain source.
    FailedToUpdateChainTip(String),
    /// The tree state at a requested height could not be fetched or parsed.
    FailedToReceiveTreeState(String),
    /// A range of compact blocks could not be downloaded.
    FailedToDownloadBlocks(String),
    /// The account's stored metadata could not be read, or is unusable.
    FailedToRetrieveAccount(StoreError),
    /// The account could not be registered at its birthday.
    FailedToInitAccount(StoreError),
    /// The recorded chain state could not be verified or repaired.
    FailedToVerifyChainState(StoreError),
    /// The set of completed subtree roots could not be brought up to date.
    FailedToUpdateSubtreeRoots(String),
    /// Scan results could not be committed to the database.
    FailedToUpdateDatabase(StoreError),
    /// The account's spendable notes could not be loaded.
    FailedToRetrieveSpendableNotes(StoreError),
    /// The block scanner rejected the downloaded blocks.
    Scanner(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::FailedToUpdateChainTip(msg) => {
                write!(f, "Failed to fetch the chain tip: {}", msg)
            }
            SyncError::FailedToReceiveTreeState(msg) => {
                write!(f, "Failed to receive a tree state: {}", msg)
            }
            SyncError::FailedToDownloadBlocks(msg) => {
                write!(f, "Failed to download compact blocks: {}", msg)
            }
            SyncError::FailedToRetrieveAccount(e) => {
                write!(f, "Failed to retrieve the account: {}", e)
            }
            SyncError::FailedToInitAccount(e) => {
                write!(f, "Failed to initialize the account: {}", e)
            }
            SyncError::FailedToVerifyChainState(e) => {
                write!(f, "Failed to verify the recorded chain state: {}", e)
            }
            SyncError::FailedToUpdateSubtreeRoots(msg) => {
                write!(f, "Failed to update subtree roots: {}", msg)
            }
            SyncError::FailedToUpdateDatabase(e) => {
                write!(f, "Failed to commit scan results: {}", e)
            }
            SyncError::FailedToRetrieveSpendableNotes(e) => {
                write!(f, "Failed to load spendable notes: {}", e)
            }
            SyncError::Scanner(msg) => {
                write!(f, "The block scanner failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::FailedToRetrieveAccount(e)
            | SyncError::FailedToInitAccount(e)
            | SyncError::FailedToVerifyChainState(e)
            | SyncError::FailedToUpdateDatabase(e)
            | SyncError::FailedToRetrieveSpendableNotes(e) => Some(e),
            _ => None,
        }
    }
}
