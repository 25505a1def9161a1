//! Compact block wire structures.
//!
//! These mirror the compact block stream served by light-client data sources:
//! each block is reduced to the per-action data needed for trial decryption
//! (nullifier, note commitment, ephemeral key, and the truncated ciphertext),
//! plus the chain metadata needed to position commitments in the note
//! commitment tree. The message definitions are committed to the tree rather
//! than generated at build time.

use crate::{BlockHash, BlockHeight};

/// ChainMetadata represents information about the state of the chain as of a
/// given block.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChainMetadata {
    /// the size of the note commitment tree as of the end of this block
    #[prost(uint32, tag = "1")]
    pub commitment_tree_size: u32,
}

/// CompactBlock is a packaging of ONLY the data from a block that's needed to:
///
/// 1. Detect a payment to your shielded address
/// 2. Detect a spend of your shielded notes
/// 3. Update your witnesses to generate new spend proofs.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactBlock {
    /// the version of this wire format, for storage
    #[prost(uint32, tag = "1")]
    pub proto_version: u32,
    /// the height of this block
    #[prost(uint64, tag = "2")]
    pub height: u64,
    /// the ID (hash) of this block, same as in block explorers
    #[prost(bytes = "vec", tag = "3")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
    /// the ID (hash) of this block's predecessor
    #[prost(bytes = "vec", tag = "4")]
    pub prev_hash: ::prost::alloc::vec::Vec<u8>,
    /// Unix epoch time when the block was mined
    #[prost(uint32, tag = "5")]
    pub time: u32,
    /// zero or more compact transactions from this block
    #[prost(message, repeated, tag = "7")]
    pub vtx: ::prost::alloc::vec::Vec<CompactTx>,
    /// information about the state of the chain as of this block
    #[prost(message, optional, tag = "8")]
    pub chain_metadata: ::core::option::Option<ChainMetadata>,
}

/// CompactTx contains the minimum information for a wallet to know if this
/// transaction is relevant to it (either pays to it or spends from it).
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactTx {
    /// the index within the full (not compact) block
    #[prost(uint64, tag = "1")]
    pub index: u64,
    /// the transaction ID (hash, txid)
    #[prost(bytes = "vec", tag = "2")]
    pub hash: ::prost::alloc::vec::Vec<u8>,
    /// the shielded actions of this transaction
    #[prost(message, repeated, tag = "6")]
    pub actions: ::prost::alloc::vec::Vec<CompactAction>,
}

/// CompactAction is a shielded action stripped of the fields that trial
/// decryption does not need.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactAction {
    /// the nullifier revealed by the action (32 bytes)
    #[prost(bytes = "vec", tag = "1")]
    pub nullifier: ::prost::alloc::vec::Vec<u8>,
    /// the x-coordinate of the note commitment (32 bytes)
    #[prost(bytes = "vec", tag = "2")]
    pub cmx: ::prost::alloc::vec::Vec<u8>,
    /// the ephemeral public key of the note encryption (32 bytes)
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_key: ::prost::alloc::vec::Vec<u8>,
    /// the first 52 bytes of the encrypted note plaintext
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: ::prost::alloc::vec::Vec<u8>,
}

impl CompactBlock {
    /// Returns the height of this block, if it is representable.
    pub fn height(&self) -> Option<BlockHeight> {
        BlockHeight::try_from(self.height).ok()
    }

    /// Returns the hash of this block, if it has the expected width.
    pub fn hash(&self) -> Option<BlockHash> {
        BlockHash::try_from_slice(&self.hash)
    }

    /// Returns the hash of this block's predecessor, if it has the expected
    /// width.
    pub fn prev_hash(&self) -> Option<BlockHash> {
        BlockHash::try_from_slice(&self.prev_hash)
    }

    /// Returns the number of shielded actions in this block.
    pub fn action_count(&self) -> usize {
        self.vtx.iter().map(|tx| tx.actions.len()).sum()
    }
}
