//! Serialization formats for note commitment tree data.
//!
//! Shards and frontiers are persisted (and exchanged with the chain source) as
//! versioned byte blobs. The shard format is a recursive tagged encoding of the
//! pruned tree structure; the frontier format records the rightmost path of a
//! non-empty tree.

use std::io::{self, Read, Write};
use std::ops::Deref;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use incrementalmerkletree::{
    frontier::{Frontier, NonEmptyFrontier},
    Position,
};
use shardtree::{Node, PrunableTree, RetentionFlags, Tree};
use zcash_encoding::{Optional, Vector};

const SER_V1: u8 = 1;

const NIL_TAG: u8 = 0;
const LEAF_TAG: u8 = 1;
const PARENT_TAG: u8 = 2;

/// A hashable node within a Merkle tree.
pub trait HashSer
where
    Self: Sized,
{
    /// Parses a node from the given byte source.
    fn read<R: Read>(reader: R) -> io::Result<Self>;

    /// Writes a byte representation of this node to the given byte sink.
    fn write<W: Write>(&self, writer: W) -> io::Result<()>;
}

/// Writes the provided [`PrunableTree`] in the current serialized form.
pub fn write_shard<H: HashSer, W: Write>(writer: &mut W, tree: &PrunableTree<H>) -> io::Result<()> {
    fn write_inner<H: HashSer, W: Write>(
        mut writer: &mut W,
        tree: &PrunableTree<H>,
    ) -> io::Result<()> {
        match tree.deref() {
            Node::Parent { ann, left, right } => {
                writer.write_u8(PARENT_TAG)?;
                Optional::write(&mut writer, ann.as_deref(), |w, h| {
                    <H as HashSer>::write(h, w)
                })?;
                write_inner(writer, left)?;
                write_inner(writer, right)
            }
            Node::Leaf { value } => {
                writer.write_u8(LEAF_TAG)?;
                value.0.write(&mut writer)?;
                writer.write_u8(value.1.bits())
            }
            Node::Nil => writer.write_u8(NIL_TAG),
        }
    }

    writer.write_u8(SER_V1)?;
    write_inner(writer, tree)
}

fn read_shard_v1<H: HashSer, R: Read>(mut reader: &mut R) -> io::Result<PrunableTree<H>> {
    match reader.read_u8()? {
        PARENT_TAG => {
            let ann = Optional::read(&mut reader, <H as HashSer>::read)?.map(Arc::new);
            let left = read_shard_v1(reader)?;
            let right = read_shard_v1(reader)?;
            Ok(Tree::parent(ann, left, right))
        }
        LEAF_TAG => {
            let value = H::read(&mut reader)?;
            let flags = reader.read_u8()?;
            RetentionFlags::from_bits(flags)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Byte value {} does not correspond to a valid set of retention flags",
                            flags
                        ),
                    )
                })
                .map(|flags| Tree::leaf((value, flags)))
        }
        NIL_TAG => Ok(Tree::empty()),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Node tag not recognized: {}", other),
        )),
    }
}

/// Reads a [`PrunableTree`] from the provided [`Read`] instance.
///
/// This function operates by first parsing a 1-byte version identifier, and then
/// delegating to the correct deserialization function for the observed version.
pub fn read_shard<H: HashSer, R: Read>(mut reader: R) -> io::Result<PrunableTree<H>> {
    match reader.read_u8()? {
        SER_V1 => read_shard_v1(&mut reader),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Shard serialization version not recognized: {}", other),
        )),
    }
}

/// Writes a frontier in the current serialized form.
pub fn write_frontier<H: HashSer, W: Write, const DEPTH: u8>(
    mut writer: W,
    frontier: &Frontier<H, DEPTH>,
) -> io::Result<()> {
    writer.write_u8(SER_V1)?;
    Optional::write(&mut writer, frontier.value(), |w, f| {
        write_nonempty_frontier(w, f)
    })
}

fn write_nonempty_frontier<H: HashSer, W: Write>(
    mut writer: W,
    frontier: &NonEmptyFrontier<H>,
) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(frontier.position().into())?;
    frontier.leaf().write(&mut writer)?;
    Vector::write(&mut writer, frontier.ommers(), |w, h| h.write(w))
}

/// Reads a frontier from the provided [`Read`] instance.
///
/// An empty byte source is not a valid frontier encoding; the empty frontier is
/// encoded explicitly.
pub fn read_frontier<H: HashSer + Clone, R: Read, const DEPTH: u8>(
    mut reader: R,
) -> io::Result<Frontier<H, DEPTH>> {
    match reader.read_u8()? {
        SER_V1 => {
            let parts = Optional::read(&mut reader, |r| {
                let position = r.read_u64::<LittleEndian>()?;
                let leaf = H::read(&mut *r)?;
                let ommers = Vector::read(&mut *r, |or| H::read(or))?;
                Ok((position, leaf, ommers))
            })?;
            match parts {
                None => Ok(Frontier::empty()),
                Some((position, leaf, ommers)) => {
                    Frontier::from_parts(Position::from(position), leaf, ommers).map_err(|err| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Parsing resulted in an invalid Merkle frontier: {:?}", err),
                        )
                    })
                }
            }
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frontier serialization version not recognized: {}", other),
        )),
    }
}
