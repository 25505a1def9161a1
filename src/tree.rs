//! The note commitment tree's node type and dimensions.

use std::fmt;
use std::io::{self, Read, Write};

use blake2b_simd::Params;
use incrementalmerkletree::{Hashable, Level};
use lazy_static::lazy_static;

use crate::serialization::HashSer;

/// The depth of the note commitment tree.
pub const TREE_DEPTH: u8 = 32;

/// The height of the subtrees in which the note commitment tree is persisted.
/// Completed subtrees of this height have their roots served by the chain
/// source.
pub const SHARD_HEIGHT: u8 = 16;

const MERKLE_PERSONALIZATION: &[u8; 16] = b"ShieldSyncMerkle";

lazy_static! {
    static ref EMPTY_ROOTS: Vec<NodeHash> = {
        let mut v = vec![NodeHash::empty_leaf()];
        for d in 0..TREE_DEPTH {
            let next = NodeHash::combine(d.into(), &v[usize::from(d)], &v[usize::from(d)]);
            v.push(next);
        }
        v
    };
}

/// Compute a parent node in the note commitment tree given its two children.
pub fn merkle_hash(level: u8, lhs: &[u8; 32], rhs: &[u8; 32]) -> [u8; 32] {
    let digest = Params::new()
        .hash_length(32)
        .personal(MERKLE_PERSONALIZATION)
        .to_state()
        .update(&[level])
        .update(lhs)
        .update(rhs)
        .finalize();
    let mut repr = [0u8; 32];
    repr.copy_from_slice(digest.as_bytes());
    repr
}

/// A node within the note commitment tree.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NodeHash {
    repr: [u8; 32],
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHash")
            .field("repr", &hex::encode(self.repr))
            .finish()
    }
}

impl NodeHash {
    /// Creates a tree node directly from its 32-byte representation, as it
    /// appears in a compact action's note commitment field.
    pub fn from_bytes(repr: [u8; 32]) -> Self {
        NodeHash { repr }
    }

    /// Returns the 32-byte representation of this node.
    pub fn to_bytes(self) -> [u8; 32] {
        self.repr
    }
}

impl Hashable for NodeHash {
    fn empty_leaf() -> Self {
        NodeHash { repr: [0u8; 32] }
    }

    fn combine(level: Level, lhs: &Self, rhs: &Self) -> Self {
        NodeHash {
            repr: merkle_hash(level.into(), &lhs.repr, &rhs.repr),
        }
    }

    fn empty_root(level: Level) -> Self {
        EMPTY_ROOTS[<usize>::from(level)]
    }
}

impl HashSer for NodeHash {
    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut repr = [0u8; 32];
        reader.read_exact(&mut repr)?;
        Ok(NodeHash { repr })
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.repr.as_ref())
    }
}

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing {
    use proptest::prelude::*;

    use super::NodeHash;

    prop_compose! {
        pub fn arb_node()(value in prop::array::uniform32(prop::num::u8::ANY)) -> NodeHash {
            NodeHash {
                repr: value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use incrementalmerkletree::{Hashable, Level};
    use proptest::prelude::*;

    use super::{testing::arb_node, NodeHash};

    #[test]
    fn empty_roots_are_consistent() {
        let empty = NodeHash::empty_leaf();
        assert_eq!(
            NodeHash::combine(Level::from(0), &empty, &empty),
            NodeHash::empty_root(Level::from(1))
        );
        let one = NodeHash::empty_root(Level::from(1));
        assert_eq!(
            NodeHash::combine(Level::from(1), &one, &one),
            NodeHash::empty_root(Level::from(2))
        );
    }

    proptest! {
        #[test]
        fn combine_is_level_dependent(lhs in arb_node(), rhs in arb_node()) {
            let at_zero = NodeHash::combine(Level::from(0), &lhs, &rhs);
            let at_one = NodeHash::combine(Level::from(1), &lhs, &rhs);
            prop_assert_ne!(at_zero, at_one);
        }
    }
}
