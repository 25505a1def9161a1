//! The interface between the synchronization engine and the remote chain.
//!
//! Embedders provide an implementation of [`ChainSource`] over whatever
//! transport reaches their block-data server; the engine only consumes the
//! four queries defined here.

use std::fmt;
use std::io;
use std::ops::Range;

use incrementalmerkletree::frontier::Frontier;

use crate::proto::CompactBlock;
use crate::serialization::read_frontier;
use crate::tree::{NodeHash, TREE_DEPTH};
use crate::{BlockHash, BlockHeight};

/// A source of chain data for the synchronization engine.
///
/// All methods take `&self`; implementations are expected to manage their own
/// connection state internally. Errors are surfaced to the engine as display
/// strings only, so the error type needs no structure beyond [`fmt::Display`].
#[trait_variant::make(ChainSource: Send)]
pub trait LocalChainSource {
    type Error: fmt::Display;

    /// Returns the height of the current chain tip.
    async fn get_latest_block(&self) -> Result<BlockHeight, Self::Error>;

    /// Returns the note commitment tree state as of the block at the given
    /// height.
    async fn get_tree_state(&self, height: BlockHeight) -> Result<TreeState, Self::Error>;

    /// Returns the compact blocks with heights in the given half-open range,
    /// in ascending height order.
    async fn get_compact_blocks(
        &self,
        range: Range<BlockHeight>,
    ) -> Result<Vec<CompactBlock>, Self::Error>;

    /// Returns completed subtree roots of the note commitment tree, beginning
    /// at `start_index` and limited to `max_entries` results.
    async fn get_subtree_roots(
        &self,
        start_index: u64,
        max_entries: usize,
    ) -> Result<Vec<SubtreeRoot>, Self::Error>;
}

/// The note commitment tree state at a block boundary, as served by the chain
/// source.
///
/// The tree itself travels in serialized form; [`TreeState::to_chain_state`]
/// parses it into the representation the scanner consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeState {
    /// The height of the block this state describes.
    pub height: BlockHeight,
    /// The hash of the block this state describes.
    pub hash: BlockHash,
    /// The serialized frontier of the note commitment tree as of this block.
    pub tree: Vec<u8>,
}

impl TreeState {
    /// Parses the serialized frontier, producing the chain state from which
    /// scanning of the following block may proceed.
    pub fn to_chain_state(&self) -> io::Result<ChainState> {
        let frontier = read_frontier::<NodeHash, _, TREE_DEPTH>(self.tree.as_slice())?;
        Ok(ChainState::from_parts(self.height, self.hash, frontier))
    }
}

/// The validated state of the chain at a block boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainState {
    block_height: BlockHeight,
    block_hash: BlockHash,
    final_tree: Frontier<NodeHash, TREE_DEPTH>,
}

impl ChainState {
    /// Assembles a chain state from its constituent parts.
    pub fn from_parts(
        block_height: BlockHeight,
        block_hash: BlockHash,
        final_tree: Frontier<NodeHash, TREE_DEPTH>,
    ) -> Self {
        ChainState {
            block_height,
            block_hash,
            final_tree,
        }
    }

    /// The height of the block this state describes.
    pub fn block_height(&self) -> BlockHeight {
        self.block_height
    }

    /// The hash of the block this state describes.
    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    /// The frontier of the note commitment tree after the last commitment of
    /// the block this state describes.
    pub fn final_tree(&self) -> &Frontier<NodeHash, TREE_DEPTH> {
        &self.final_tree
    }

    /// The number of leaves in the note commitment tree as of this state. This
    /// is the position at which the first commitment of the following block
    /// will be appended.
    pub fn tree_size(&self) -> u64 {
        self.final_tree
            .value()
            .map_or(0, |f| u64::from(f.position()) + 1)
    }
}

/// The role of a completed subtree in the note commitment tree, paired with
/// the height of the block that completed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubtreeRoot {
    subtree_end_height: BlockHeight,
    root_hash: NodeHash,
}

impl SubtreeRoot {
    /// Constructs a subtree root from its constituent parts.
    pub fn from_parts(subtree_end_height: BlockHeight, root_hash: NodeHash) -> Self {
        SubtreeRoot {
            subtree_end_height,
            root_hash,
        }
    }

    /// The height of the block in which the last leaf of the subtree appeared.
    pub fn subtree_end_height(&self) -> BlockHeight {
        self.subtree_end_height
    }

    /// The root hash of the completed subtree.
    pub fn root_hash(&self) -> NodeHash {
        self.root_hash
    }
}

#[cfg(any(test, feature = "test-dependencies"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-dependencies")))]
pub mod testing {
    //! An in-memory [`ChainSource`] for tests.

    use std::collections::BTreeMap;
    use std::ops::Range;
    use std::sync::{Arc, Mutex};

    use incrementalmerkletree::frontier::Frontier;

    use super::{ChainSource, SubtreeRoot, TreeState};
    use crate::proto::CompactBlock;
    use crate::serialization::write_frontier;
    use crate::tree::{NodeHash, TREE_DEPTH};
    use crate::{BlockHash, BlockHeight};

    /// Serializes the given frontier into a [`TreeState`] record.
    pub fn tree_state_from_frontier(
        height: BlockHeight,
        hash: BlockHash,
        frontier: &Frontier<NodeHash, TREE_DEPTH>,
    ) -> TreeState {
        let mut tree = vec![];
        write_frontier(&mut tree, frontier).expect("writing to a vec cannot fail");
        TreeState { height, hash, tree }
    }

    /// A chain source backed by in-memory chain data.
    ///
    /// Clones share the same underlying data, so a test can retain a handle
    /// and mutate the simulated chain while a service holds another clone.
    #[derive(Clone)]
    pub struct MockChainSource {
        inner: Arc<Mutex<Inner>>,
    }

    struct Inner {
        latest: Option<BlockHeight>,
        blocks: BTreeMap<BlockHeight, CompactBlock>,
        tree_states: BTreeMap<BlockHeight, TreeState>,
        subtree_roots: Vec<SubtreeRoot>,
    }

    impl MockChainSource {
        pub fn new() -> Self {
            MockChainSource {
                inner: Arc::new(Mutex::new(Inner {
                    latest: None,
                    blocks: BTreeMap::new(),
                    tree_states: BTreeMap::new(),
                    subtree_roots: vec![],
                })),
            }
        }

        pub fn set_latest_block(&self, height: BlockHeight) {
            self.inner.lock().unwrap().latest = Some(height);
        }

        pub fn add_block(&self, block: CompactBlock) {
            let height = block.height().expect("mock blocks carry valid heights");
            self.inner.lock().unwrap().blocks.insert(height, block);
        }

        /// Drops all blocks and tree states at or above the given height,
        /// simulating a reorganization that replaced them.
        pub fn rollback_blocks(&self, from: BlockHeight) {
            let mut inner = self.inner.lock().unwrap();
            inner.blocks.split_off(&from);
            inner.tree_states.split_off(&from);
        }

        pub fn add_tree_state(&self, state: TreeState) {
            self.inner
                .lock()
                .unwrap()
                .tree_states
                .insert(state.height, state);
        }

        pub fn set_subtree_roots(&self, roots: Vec<SubtreeRoot>) {
            self.inner.lock().unwrap().subtree_roots = roots;
        }
    }

    impl Default for MockChainSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ChainSource for MockChainSource {
        type Error = String;

        async fn get_latest_block(&self) -> Result<BlockHeight, Self::Error> {
            self.inner
                .lock()
                .unwrap()
                .latest
                .ok_or_else(|| "no chain tip configured".to_string())
        }

        async fn get_tree_state(&self, height: BlockHeight) -> Result<TreeState, Self::Error> {
            self.inner
                .lock()
                .unwrap()
                .tree_states
                .get(&height)
                .cloned()
                .ok_or_else(|| format!("no tree state at height {}", height))
        }

        async fn get_compact_blocks(
            &self,
            range: Range<BlockHeight>,
        ) -> Result<Vec<CompactBlock>, Self::Error> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .blocks
                .range(range)
                .map(|(_, block)| block.clone())
                .collect())
        }

        async fn get_subtree_roots(
            &self,
            start_index: u64,
            max_entries: usize,
        ) -> Result<Vec<SubtreeRoot>, Self::Error> {
            let start = usize::try_from(start_index).map_err(|_| "start index out of range")?;
            Ok(self
                .inner
                .lock()
                .unwrap()
                .subtree_roots
                .iter()
                .skip(start)
                .take(max_entries)
                .copied()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use incrementalmerkletree::frontier::Frontier;

    use super::testing::tree_state_from_frontier;
    use super::ChainState;
    use crate::tree::NodeHash;
    use crate::{BlockHash, BlockHeight};

    #[test]
    fn tree_state_round_trips_through_chain_state() {
        let mut frontier = Frontier::empty();
        for i in 0u8..5 {
            assert!(frontier.append(NodeHash::from_bytes([i; 32])));
        }

        let state = tree_state_from_frontier(
            BlockHeight::from_u32(1200),
            BlockHash([3; 32]),
            &frontier,
        );
        let chain_state = state.to_chain_state().unwrap();

        assert_eq!(chain_state.block_height(), BlockHeight::from_u32(1200));
        assert_eq!(chain_state.block_hash(), BlockHash([3; 32]));
        assert_eq!(chain_state.tree_size(), 5);
        assert_eq!(chain_state.final_tree(), &frontier);
    }

    #[test]
    fn empty_tree_state_has_zero_size() {
        let state = tree_state_from_frontier(
            BlockHeight::from_u32(100),
            BlockHash([0; 32]),
            &Frontier::empty(),
        );
        let chain_state = state.to_chain_state().unwrap();
        assert_eq!(chain_state.tree_size(), 0);
        assert_eq!(
            chain_state,
            ChainState::from_parts(
                BlockHeight::from_u32(100),
                BlockHash([0; 32]),
                Frontier::empty()
            )
        );
    }
}
