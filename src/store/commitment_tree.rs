//! SQLite-backed storage for the note commitment tree.
//!
//! [`SqliteShardStore`] binds the `shardtree` storage trait to the
//! `shard_tree`, `checkpoints`, and `checkpoints_mark_removed` tables, scoped
//! to a single account. The cap (the tree levels above the shard roots) is
//! not persisted; it is reconstructed from shard roots on demand, which keeps
//! the durable schema to the tables above. Root and witness queries that
//! would need a durable cap are outside the engine's operation set.

use std::collections::BTreeSet;
use std::io::{self, Cursor};
use std::marker::PhantomData;
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::{error, fmt};

use incrementalmerkletree::{Address, Level, Position};
use rusqlite::{named_params, OptionalExtension};
use shardtree::store::{Checkpoint, ShardStore, TreeState};
use shardtree::{LocatedPrunableTree, Node, PrunableTree, RetentionFlags};

use super::account_id_text;
use crate::client::SubtreeRoot;
use crate::serialization::{read_shard, write_shard, HashSer};
use crate::{AccountId, BlockHeight};

/// Errors produced by the SQLite-backed [`ShardStore`] implementation.
#[derive(Debug)]
pub enum Error {
    /// Stored shard or root data could not be deserialized.
    Serialization(io::Error),
    /// A database query or update failed.
    Query(rusqlite::Error),
    /// A checkpoint was re-added with a tree state or removed-marks set that
    /// differs from what is stored under the same identifier. A reorg should
    /// have truncated the tree before any re-checkpointing at this id.
    CheckpointConflict {
        checkpoint_id: BlockHeight,
        checkpoint: Checkpoint,
        extant_tree_state: TreeState,
        extant_marks_removed: Option<BTreeSet<Position>>,
    },
    /// Subtree roots were inserted at indices discontinuous with the roots
    /// already present.
    SubtreeDiscontinuity {
        attempted_insertion_range: Range<u64>,
        existing_range: Range<u64>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Error::Serialization(err) => write!(f, "Commitment tree serialization error: {}", err),
            Error::Query(err) => write!(f, "Commitment tree query or update error: {}", err),
            Error::CheckpointConflict {
                checkpoint_id,
                checkpoint,
                extant_tree_state,
                extant_marks_removed,
            } => {
                write!(
                    f,
                    "Conflict at checkpoint id {}, tried to insert {:?}, which is incompatible with existing state ({:?}, {:?})",
                    checkpoint_id, checkpoint, extant_tree_state, extant_marks_removed
                )
            }
            Error::SubtreeDiscontinuity {
                attempted_insertion_range,
                existing_range,
            } => {
                write!(
                    f,
                    "Attempted to write subtree roots with indices {:?} which is discontinuous with existing subtree range {:?}",
                    attempted_insertion_range, existing_range,
                )
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            Error::Serialization(e) => Some(e),
            Error::Query(e) => Some(e),
            Error::CheckpointConflict { .. } => None,
            Error::SubtreeDiscontinuity { .. } => None,
        }
    }
}

/// A [`ShardStore`] over the commitment tree tables, bound to one account.
pub struct SqliteShardStore<C, H, const SHARD_HEIGHT: u8> {
    pub(crate) conn: C,
    account_id: AccountId,
    _hash_type: PhantomData<H>,
}

impl<C, H, const SHARD_HEIGHT: u8> SqliteShardStore<C, H, SHARD_HEIGHT> {
    pub(crate) fn from_connection(conn: C, account_id: AccountId) -> Self {
        SqliteShardStore {
            conn,
            account_id,
            _hash_type: PhantomData,
        }
    }

    fn shard_root_level() -> Level {
        Level::from(SHARD_HEIGHT)
    }
}

impl<'conn, 'a: 'conn, H: HashSer, const SHARD_HEIGHT: u8> ShardStore
    for SqliteShardStore<&'a rusqlite::Transaction<'conn>, H, SHARD_HEIGHT>
{
    type H = H;
    type CheckpointId = BlockHeight;
    type Error = Error;

    fn get_shard(
        &self,
        shard_root: Address,
    ) -> Result<Option<LocatedPrunableTree<Self::H>>, Self::Error> {
        get_shard(self.conn, self.account_id, shard_root)
    }

    fn last_shard(&self) -> Result<Option<LocatedPrunableTree<Self::H>>, Self::Error> {
        last_shard(self.conn, self.account_id, Self::shard_root_level())
    }

    fn put_shard(&mut self, subtree: LocatedPrunableTree<Self::H>) -> Result<(), Self::Error> {
        put_shard(self.conn, self.account_id, subtree)
    }

    fn get_shard_roots(&self) -> Result<Vec<Address>, Self::Error> {
        get_shard_roots(self.conn, self.account_id, Self::shard_root_level())
    }

    fn truncate(&mut self, from: Address) -> Result<(), Self::Error> {
        truncate(self.conn, self.account_id, from)
    }

    fn get_cap(&self) -> Result<PrunableTree<Self::H>, Self::Error> {
        Ok(PrunableTree::empty())
    }

    fn put_cap(&mut self, _cap: PrunableTree<Self::H>) -> Result<(), Self::Error> {
        // The cap is not persisted.
        Ok(())
    }

    fn min_checkpoint_id(&self) -> Result<Option<Self::CheckpointId>, Self::Error> {
        min_checkpoint_id(self.conn, self.account_id)
    }

    fn max_checkpoint_id(&self) -> Result<Option<Self::CheckpointId>, Self::Error> {
        max_checkpoint_id(self.conn, self.account_id)
    }

    fn add_checkpoint(
        &mut self,
        checkpoint_id: Self::CheckpointId,
        checkpoint: Checkpoint,
    ) -> Result<(), Self::Error> {
        add_checkpoint(self.conn, self.account_id, checkpoint_id, checkpoint)
    }

    fn checkpoint_count(&self) -> Result<usize, Self::Error> {
        checkpoint_count(self.conn, self.account_id)
    }

    fn get_checkpoint_at_depth(
        &self,
        checkpoint_depth: usize,
    ) -> Result<Option<(Self::CheckpointId, Checkpoint)>, Self::Error> {
        // The consuming library uses depth 0 to mean the current (not yet
        // checkpointed) tree state, so the stored history begins at depth 1.
        if checkpoint_depth == 0 {
            Ok(None)
        } else {
            get_checkpoint_at_depth(self.conn, self.account_id, checkpoint_depth - 1)
        }
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &Self::CheckpointId,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        get_checkpoint(self.conn, self.account_id, *checkpoint_id)
    }

    fn with_checkpoints<F>(&mut self, limit: usize, callback: F) -> Result<(), Self::Error>
    where
        F: FnMut(&Self::CheckpointId, &Checkpoint) -> Result<(), Self::Error>,
    {
        with_checkpoints(self.conn, self.account_id, limit, callback)
    }

    fn update_checkpoint_with<F>(
        &mut self,
        checkpoint_id: &Self::CheckpointId,
        update: F,
    ) -> Result<bool, Self::Error>
    where
        F: Fn(&mut Checkpoint) -> Result<(), Self::Error>,
    {
        update_checkpoint_with(self.conn, self.account_id, *checkpoint_id, update)
    }

    fn remove_checkpoint(&mut self, checkpoint_id: &Self::CheckpointId) -> Result<(), Self::Error> {
        remove_checkpoint(self.conn, self.account_id, *checkpoint_id)
    }

    fn truncate_checkpoints(
        &mut self,
        checkpoint_id: &Self::CheckpointId,
    ) -> Result<(), Self::Error> {
        truncate_checkpoints(self.conn, self.account_id, *checkpoint_id)
    }
}

impl<H: HashSer, const SHARD_HEIGHT: u8> ShardStore
    for SqliteShardStore<rusqlite::Connection, H, SHARD_HEIGHT>
{
    type H = H;
    type CheckpointId = BlockHeight;
    type Error = Error;

    fn get_shard(
        &self,
        shard_root: Address,
    ) -> Result<Option<LocatedPrunableTree<Self::H>>, Self::Error> {
        get_shard(&self.conn, self.account_id, shard_root)
    }

    fn last_shard(&self) -> Result<Option<LocatedPrunableTree<Self::H>>, Self::Error> {
        last_shard(&self.conn, self.account_id, Self::shard_root_level())
    }

    fn put_shard(&mut self, subtree: LocatedPrunableTree<Self::H>) -> Result<(), Self::Error> {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        put_shard(&tx, self.account_id, subtree)?;
        tx.commit().map_err(Error::Query)
    }

    fn get_shard_roots(&self) -> Result<Vec<Address>, Self::Error> {
        get_shard_roots(&self.conn, self.account_id, Self::shard_root_level())
    }

    fn truncate(&mut self, from: Address) -> Result<(), Self::Error> {
        truncate(&self.conn, self.account_id, from)
    }

    fn get_cap(&self) -> Result<PrunableTree<Self::H>, Self::Error> {
        Ok(PrunableTree::empty())
    }

    fn put_cap(&mut self, _cap: PrunableTree<Self::H>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn min_checkpoint_id(&self) -> Result<Option<Self::CheckpointId>, Self::Error> {
        min_checkpoint_id(&self.conn, self.account_id)
    }

    fn max_checkpoint_id(&self) -> Result<Option<Self::CheckpointId>, Self::Error> {
        max_checkpoint_id(&self.conn, self.account_id)
    }

    fn add_checkpoint(
        &mut self,
        checkpoint_id: Self::CheckpointId,
        checkpoint: Checkpoint,
    ) -> Result<(), Self::Error> {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        add_checkpoint(&tx, self.account_id, checkpoint_id, checkpoint)?;
        tx.commit().map_err(Error::Query)
    }

    fn checkpoint_count(&self) -> Result<usize, Self::Error> {
        checkpoint_count(&self.conn, self.account_id)
    }

    fn get_checkpoint_at_depth(
        &self,
        checkpoint_depth: usize,
    ) -> Result<Option<(Self::CheckpointId, Checkpoint)>, Self::Error> {
        if checkpoint_depth == 0 {
            Ok(None)
        } else {
            get_checkpoint_at_depth(&self.conn, self.account_id, checkpoint_depth - 1)
        }
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &Self::CheckpointId,
    ) -> Result<Option<Checkpoint>, Self::Error> {
        get_checkpoint(&self.conn, self.account_id, *checkpoint_id)
    }

    fn with_checkpoints<F>(&mut self, limit: usize, callback: F) -> Result<(), Self::Error>
    where
        F: FnMut(&Self::CheckpointId, &Checkpoint) -> Result<(), Self::Error>,
    {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        with_checkpoints(&tx, self.account_id, limit, callback)?;
        tx.commit().map_err(Error::Query)
    }

    fn update_checkpoint_with<F>(
        &mut self,
        checkpoint_id: &Self::CheckpointId,
        update: F,
    ) -> Result<bool, Self::Error>
    where
        F: Fn(&mut Checkpoint) -> Result<(), Self::Error>,
    {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        let result = update_checkpoint_with(&tx, self.account_id, *checkpoint_id, update)?;
        tx.commit().map_err(Error::Query)?;
        Ok(result)
    }

    fn remove_checkpoint(&mut self, checkpoint_id: &Self::CheckpointId) -> Result<(), Self::Error> {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        remove_checkpoint(&tx, self.account_id, *checkpoint_id)?;
        tx.commit().map_err(Error::Query)
    }

    fn truncate_checkpoints(
        &mut self,
        checkpoint_id: &Self::CheckpointId,
    ) -> Result<(), Self::Error> {
        let tx = self.conn.transaction().map_err(Error::Query)?;
        truncate_checkpoints(&tx, self.account_id, *checkpoint_id)?;
        tx.commit().map_err(Error::Query)
    }
}

pub(crate) fn get_shard<H: HashSer>(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    shard_root_addr: Address,
) -> Result<Option<LocatedPrunableTree<H>>, Error> {
    conn.query_row(
        "SELECT shard_data, root_hash
         FROM shard_tree
         WHERE shard_index = :shard_index
         AND account_id = :account_id",
        named_params![
            ":shard_index": shard_root_addr.index(),
            ":account_id": account_id_text(account_id),
        ],
        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<Vec<u8>>>(1)?)),
    )
    .optional()
    .map_err(Error::Query)?
    .map(|(shard_data, root_hash)| {
        let shard_tree = read_shard(Cursor::new(shard_data)).map_err(Error::Serialization)?;
        let located_tree = LocatedPrunableTree::from_parts(shard_root_addr, shard_tree);
        if let Some(root_hash_data) = root_hash {
            let root_hash = H::read(Cursor::new(root_hash_data)).map_err(Error::Serialization)?;
            Ok(located_tree.reannotate_root(Some(Arc::new(root_hash))))
        } else {
            Ok(located_tree)
        }
    })
    .transpose()
}

pub(crate) fn last_shard<H: HashSer>(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    shard_root_level: Level,
) -> Result<Option<LocatedPrunableTree<H>>, Error> {
    conn.query_row(
        "SELECT shard_index, shard_data
         FROM shard_tree
         WHERE account_id = :account_id
         ORDER BY shard_index DESC
         LIMIT 1",
        named_params![":account_id": account_id_text(account_id)],
        |row| {
            let shard_index: u64 = row.get(0)?;
            let shard_data: Vec<u8> = row.get(1)?;
            Ok((shard_index, shard_data))
        },
    )
    .optional()
    .map_err(Error::Query)?
    .map(|(shard_index, shard_data)| {
        let shard_root = Address::from_parts(shard_root_level, shard_index);
        let shard_tree = read_shard(Cursor::new(shard_data)).map_err(Error::Serialization)?;
        Ok(LocatedPrunableTree::from_parts(shard_root, shard_tree))
    })
    .transpose()
}

/// Returns an error iff the proposed insertion range for tree shards would
/// create a discontinuity in the stored shard indices.
fn check_shard_discontinuity(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    proposed_insertion_range: Range<u64>,
) -> Result<(), Error> {
    if let Ok((Some(stored_min), Some(stored_max))) = conn
        .query_row(
            "SELECT MIN(shard_index), MAX(shard_index)
             FROM shard_tree
             WHERE account_id = :account_id",
            named_params![":account_id": account_id_text(account_id)],
            |row| {
                let min = row.get::<_, Option<u64>>(0)?;
                let max = row.get::<_, Option<u64>>(1)?;
                Ok((min, max))
            },
        )
        .map_err(Error::Query)
    {
        // Overlapping or directly adjacent ranges do not create a
        // discontinuity, comparing start-inclusive end-exclusive bounds.
        let (cur_start, cur_end) = (stored_min, stored_max + 1);
        let (ins_start, ins_end) = (proposed_insertion_range.start, proposed_insertion_range.end);
        if cur_start > ins_end || ins_start > cur_end {
            return Err(Error::SubtreeDiscontinuity {
                attempted_insertion_range: proposed_insertion_range,
                existing_range: cur_start..cur_end,
            });
        }
    }

    Ok(())
}

fn tree_contains_marked<H>(tree: &PrunableTree<H>) -> bool {
    match tree.deref() {
        Node::Parent { left, right, .. } => {
            tree_contains_marked(left) || tree_contains_marked(right)
        }
        Node::Leaf { value } => value.1.contains(RetentionFlags::MARKED),
        Node::Nil => false,
    }
}

pub(crate) fn put_shard<H: HashSer>(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    subtree: LocatedPrunableTree<H>,
) -> Result<(), Error> {
    let subtree_root_hash = subtree
        .root()
        .annotation()
        .and_then(|ann| {
            ann.as_ref().map(|rc| {
                let mut root_hash = vec![];
                rc.write(&mut root_hash)?;
                Ok(root_hash)
            })
        })
        .transpose()
        .map_err(Error::Serialization)?;

    let mut subtree_data = vec![];
    write_shard(&mut subtree_data, subtree.root()).map_err(Error::Serialization)?;

    let shard_index = subtree.root_addr().index();

    check_shard_discontinuity(conn, account_id, shard_index..shard_index + 1)?;

    let mut stmt_put_shard = conn
        .prepare_cached(
            "INSERT INTO shard_tree (account_id, shard_index, root_hash, shard_data, contains_marked)
             VALUES (:account_id, :shard_index, :root_hash, :shard_data, :contains_marked)
             ON CONFLICT (shard_index, account_id) DO UPDATE
             SET root_hash = :root_hash,
             shard_data = :shard_data,
             contains_marked = :contains_marked",
        )
        .map_err(Error::Query)?;

    stmt_put_shard
        .execute(named_params![
            ":account_id": account_id_text(account_id),
            ":shard_index": shard_index,
            ":root_hash": subtree_root_hash,
            ":shard_data": subtree_data,
            ":contains_marked": tree_contains_marked(subtree.root()),
        ])
        .map_err(Error::Query)?;

    Ok(())
}

pub(crate) fn get_shard_roots(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    shard_root_level: Level,
) -> Result<Vec<Address>, Error> {
    let mut stmt = conn
        .prepare(
            "SELECT shard_index
             FROM shard_tree
             WHERE account_id = :account_id
             ORDER BY shard_index",
        )
        .map_err(Error::Query)?;
    let mut rows = stmt
        .query(named_params![":account_id": account_id_text(account_id)])
        .map_err(Error::Query)?;

    let mut res = vec![];
    while let Some(row) = rows.next().map_err(Error::Query)? {
        res.push(Address::from_parts(
            shard_root_level,
            row.get(0).map_err(Error::Query)?,
        ));
    }
    Ok(res)
}

pub(crate) fn truncate(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    from: Address,
) -> Result<(), Error> {
    conn.execute(
        "DELETE FROM shard_tree
         WHERE account_id = :account_id
         AND shard_index >= :shard_index",
        named_params![
            ":account_id": account_id_text(account_id),
            ":shard_index": from.index(),
        ],
    )
    .map_err(Error::Query)
    .map(|_| ())
}

pub(crate) fn get_latest_shard_index(
    conn: &rusqlite::Connection,
    account_id: AccountId,
) -> Result<Option<u64>, Error> {
    conn.query_row(
        "SELECT MAX(shard_index)
         FROM shard_tree
         WHERE account_id = :account_id",
        named_params![":account_id": account_id_text(account_id)],
        |row| row.get::<_, Option<u64>>(0),
    )
    .map_err(Error::Query)
}

pub(crate) fn min_checkpoint_id(
    conn: &rusqlite::Connection,
    account_id: AccountId,
) -> Result<Option<BlockHeight>, Error> {
    conn.query_row(
        "SELECT MIN(checkpoint_id)
         FROM checkpoints
         WHERE account_id = :account_id",
        named_params![":account_id": account_id_text(account_id)],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Query)
}

pub(crate) fn max_checkpoint_id(
    conn: &rusqlite::Connection,
    account_id: AccountId,
) -> Result<Option<BlockHeight>, Error> {
    conn.query_row(
        "SELECT MAX(checkpoint_id)
         FROM checkpoints
         WHERE account_id = :account_id",
        named_params![":account_id": account_id_text(account_id)],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Query)
}

/// Returns the id of the most recent checkpoint at or below the given height.
pub(crate) fn max_checkpoint_id_at_or_below(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    height: BlockHeight,
) -> Result<Option<BlockHeight>, Error> {
    conn.query_row(
        "SELECT MAX(checkpoint_id)
         FROM checkpoints
         WHERE account_id = :account_id
         AND checkpoint_id <= :height",
        named_params![
            ":account_id": account_id_text(account_id),
            ":height": u32::from(height),
        ],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Query)
}

pub(crate) fn add_checkpoint(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
    checkpoint: Checkpoint,
) -> Result<(), Error> {
    let extant_tree_state = conn
        .query_row(
            "SELECT position
             FROM checkpoints
             WHERE checkpoint_id = :checkpoint_id
             AND account_id = :account_id",
            named_params![
                ":checkpoint_id": u32::from(checkpoint_id),
                ":account_id": account_id_text(account_id),
            ],
            |row| {
                row.get::<_, Option<u64>>(0).map(|opt| {
                    opt.map_or_else(
                        || TreeState::Empty,
                        |pos| TreeState::AtPosition(Position::from(pos)),
                    )
                })
            },
        )
        .optional()
        .map_err(Error::Query)?;

    match extant_tree_state {
        Some(current) => {
            if current != checkpoint.tree_state() {
                // A changed position under an existing checkpoint id means a
                // reorg went unrepaired; refuse to overwrite the history.
                Err(Error::CheckpointConflict {
                    checkpoint_id,
                    checkpoint,
                    extant_tree_state: current,
                    extant_marks_removed: None,
                })
            } else {
                // The re-add is a no-op only if the removed marks also agree.
                let marks_removed = get_marks_removed(conn, account_id, checkpoint_id)?;
                if &marks_removed == checkpoint.marks_removed() {
                    Ok(())
                } else {
                    Err(Error::CheckpointConflict {
                        checkpoint_id,
                        checkpoint,
                        extant_tree_state: current,
                        extant_marks_removed: Some(marks_removed),
                    })
                }
            }
        }
        None => {
            let mut stmt_insert_checkpoint = conn
                .prepare_cached(
                    "INSERT INTO checkpoints (account_id, checkpoint_id, position)
                     VALUES (:account_id, :checkpoint_id, :position)",
                )
                .map_err(Error::Query)?;

            stmt_insert_checkpoint
                .execute(named_params![
                    ":account_id": account_id_text(account_id),
                    ":checkpoint_id": u32::from(checkpoint_id),
                    ":position": checkpoint.position().map(u64::from),
                ])
                .map_err(Error::Query)?;

            let mut stmt_insert_mark_removed = conn
                .prepare_cached(
                    "INSERT INTO checkpoints_mark_removed
                        (account_id, checkpoint_id, mark_removed_position)
                     VALUES (:account_id, :checkpoint_id, :position)",
                )
                .map_err(Error::Query)?;

            for pos in checkpoint.marks_removed() {
                stmt_insert_mark_removed
                    .execute(named_params![
                        ":account_id": account_id_text(account_id),
                        ":checkpoint_id": u32::from(checkpoint_id),
                        ":position": u64::from(*pos),
                    ])
                    .map_err(Error::Query)?;
            }

            Ok(())
        }
    }
}

pub(crate) fn checkpoint_count(
    conn: &rusqlite::Connection,
    account_id: AccountId,
) -> Result<usize, Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM checkpoints WHERE account_id = :account_id",
        named_params![":account_id": account_id_text(account_id)],
        |row| row.get::<_, usize>(0),
    )
    .map_err(Error::Query)
}

pub(crate) fn get_marks_removed(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<BTreeSet<Position>, Error> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT mark_removed_position
             FROM checkpoints_mark_removed
             WHERE checkpoint_id = :checkpoint_id
             AND account_id = :account_id",
        )
        .map_err(Error::Query)?;
    let mark_removed_rows = stmt
        .query(named_params![
            ":checkpoint_id": u32::from(checkpoint_id),
            ":account_id": account_id_text(account_id),
        ])
        .map_err(Error::Query)?;

    mark_removed_rows
        .mapped(|row| row.get::<_, u64>(0).map(Position::from))
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(Error::Query)
}

pub(crate) fn get_checkpoint(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<Option<Checkpoint>, Error> {
    let checkpoint_position = conn
        .query_row(
            "SELECT position
             FROM checkpoints
             WHERE checkpoint_id = :checkpoint_id
             AND account_id = :account_id",
            named_params![
                ":checkpoint_id": u32::from(checkpoint_id),
                ":account_id": account_id_text(account_id),
            ],
            |row| {
                row.get::<_, Option<u64>>(0)
                    .map(|opt| opt.map(Position::from))
            },
        )
        .optional()
        .map_err(Error::Query)?;

    checkpoint_position
        .map(|pos_opt| {
            Ok(Checkpoint::from_parts(
                pos_opt.map_or(TreeState::Empty, TreeState::AtPosition),
                get_marks_removed(conn, account_id, checkpoint_id)?,
            ))
        })
        .transpose()
}

/// Returns the checkpoint that is the `depth`-th most recent by id, depth 0
/// being the most recent, or `None` when the depth exceeds the stored history.
pub(crate) fn get_checkpoint_at_depth(
    conn: &rusqlite::Connection,
    account_id: AccountId,
    checkpoint_depth: usize,
) -> Result<Option<(BlockHeight, Checkpoint)>, Error> {
    let checkpoint_parts = conn
        .query_row(
            "SELECT checkpoint_id, position
             FROM checkpoints
             WHERE account_id = :account_id
             ORDER BY checkpoint_id DESC
             LIMIT 1
             OFFSET :offset",
            named_params![
                ":account_id": account_id_text(account_id),
                ":offset": checkpoint_depth,
            ],
            |row| {
                let checkpoint_id: u32 = row.get(0)?;
                let position: Option<u64> = row.get(1)?;
                Ok((
                    BlockHeight::from(checkpoint_id),
                    position.map(Position::from),
                ))
            },
        )
        .optional()
        .map_err(Error::Query)?;

    checkpoint_parts
        .map(|(checkpoint_id, pos_opt)| {
            let marks_removed = get_marks_removed(conn, account_id, checkpoint_id)?;
            Ok((
                checkpoint_id,
                Checkpoint::from_parts(
                    pos_opt.map_or(TreeState::Empty, TreeState::AtPosition),
                    marks_removed,
                ),
            ))
        })
        .transpose()
}

pub(crate) fn with_checkpoints<F>(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    limit: usize,
    mut callback: F,
) -> Result<(), Error>
where
    F: FnMut(&BlockHeight, &Checkpoint) -> Result<(), Error>,
{
    let mut stmt_get_checkpoints = conn
        .prepare_cached(
            "SELECT checkpoint_id, position
             FROM checkpoints
             WHERE account_id = :account_id
             ORDER BY position
             LIMIT :limit",
        )
        .map_err(Error::Query)?;

    let mut rows = stmt_get_checkpoints
        .query(named_params![
            ":account_id": account_id_text(account_id),
            ":limit": limit,
        ])
        .map_err(Error::Query)?;

    while let Some(row) = rows.next().map_err(Error::Query)? {
        let checkpoint_id = row.get::<_, u32>(0).map_err(Error::Query)?;
        let tree_state = row
            .get::<_, Option<u64>>(1)
            .map(|opt| opt.map_or_else(|| TreeState::Empty, |p| TreeState::AtPosition(p.into())))
            .map_err(Error::Query)?;

        let marks_removed = get_marks_removed(conn, account_id, BlockHeight::from(checkpoint_id))?;

        callback(
            &BlockHeight::from(checkpoint_id),
            &Checkpoint::from_parts(tree_state, marks_removed),
        )?
    }

    Ok(())
}

pub(crate) fn update_checkpoint_with<F>(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
    update: F,
) -> Result<bool, Error>
where
    F: Fn(&mut Checkpoint) -> Result<(), Error>,
{
    if let Some(mut c) = get_checkpoint(conn, account_id, checkpoint_id)? {
        update(&mut c)?;
        remove_checkpoint(conn, account_id, checkpoint_id)?;
        add_checkpoint(conn, account_id, checkpoint_id, c)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub(crate) fn remove_checkpoint(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<(), Error> {
    // Mark-removed rows cascade with the checkpoint row.
    let mut stmt_delete_checkpoint = conn
        .prepare_cached(
            "DELETE FROM checkpoints
             WHERE checkpoint_id = :checkpoint_id
             AND account_id = :account_id",
        )
        .map_err(Error::Query)?;

    stmt_delete_checkpoint
        .execute(named_params![
            ":checkpoint_id": u32::from(checkpoint_id),
            ":account_id": account_id_text(account_id),
        ])
        .map_err(Error::Query)?;

    Ok(())
}

pub(crate) fn truncate_checkpoints(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<(), Error> {
    conn.execute(
        "DELETE FROM checkpoints
         WHERE account_id = :account_id
         AND checkpoint_id >= :checkpoint_id",
        named_params![
            ":account_id": account_id_text(account_id),
            ":checkpoint_id": u32::from(checkpoint_id),
        ],
    )
    .map_err(Error::Query)?;

    Ok(())
}

/// Writes completed subtree roots beginning at `start_index`.
///
/// Each root row carries the serialized single-leaf tree as its payload, so a
/// later [`get_shard`] deserializes cleanly whether or not scanning has
/// reached the subtree. When a shard row already exists, only the root hash
/// and end height are updated; scanned shard data is left in place.
pub(crate) fn put_shard_roots(
    conn: &rusqlite::Transaction<'_>,
    account_id: AccountId,
    start_index: u64,
    roots: &[SubtreeRoot],
) -> Result<(), Error> {
    if roots.is_empty() {
        return Ok(());
    }

    check_shard_discontinuity(
        conn,
        account_id,
        start_index..start_index + (roots.len() as u64),
    )?;

    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO shard_tree
                (account_id, shard_index, subtree_end_height, root_hash, shard_data)
             VALUES (:account_id, :shard_index, :subtree_end_height, :root_hash, :shard_data)
             ON CONFLICT (shard_index, account_id) DO UPDATE
             SET subtree_end_height = :subtree_end_height, root_hash = :root_hash",
        )
        .map_err(Error::Query)?;

    for (root, i) in roots.iter().zip(0u64..) {
        let mut shard_data: Vec<u8> = vec![];
        let tree = PrunableTree::leaf((root.root_hash(), RetentionFlags::EPHEMERAL));
        write_shard(&mut shard_data, &tree).map_err(Error::Serialization)?;

        let mut root_hash_data: Vec<u8> = vec![];
        root.root_hash()
            .write(&mut root_hash_data)
            .map_err(Error::Serialization)?;

        stmt.execute(named_params![
            ":account_id": account_id_text(account_id),
            ":shard_index": start_index + i,
            ":subtree_end_height": u32::from(root.subtree_end_height()),
            ":root_hash": root_hash_data,
            ":shard_data": shard_data,
        ])
        .map_err(Error::Query)?;
    }

    Ok(())
}
