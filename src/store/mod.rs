//! The durable account store.
//!
//! One SQLite database holds the notes, spend markers, synchronization
//! metadata, and note commitment tree data for any number of accounts. Every
//! multi-statement mutation is wrapped in a single transaction; the free
//! functions in this module operate over a [`rusqlite::Transaction`] for
//! writes and a [`rusqlite::Connection`] for reads so that callers control
//! the transaction boundary.

pub mod commitment_tree;

use std::path::Path;

use rusqlite::{named_params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::error::StoreError;
use crate::{AccountId, AccountMeta, BlockHash, BlockHeight, Note, NoteSpend, Nullifier};

/// The schema version written by this build of the crate. A freshly created
/// database is recorded at version 1 while empty and migrated forward to this
/// version on the same open.
const SCHEMA_VERSION: u32 = 2;

/// A handle to the SQLite database backing synchronized accounts.
#[derive(Debug)]
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Opens the database at the given path, creating it or migrating its
    /// schema forward as necessary.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path).map_err(StoreError::DbInit)?;
        // Mark-removed rows cascade with their checkpoint.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(StoreError::DbInit)?;
        init(&mut conn)?;
        Ok(Storage { conn })
    }

    /// Begins a write transaction over the underlying connection.
    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        self.conn.transaction().map_err(StoreError::from)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Creates the account's metadata record, with scanning positioned at the
    /// account birthday.
    pub fn register_account(
        &mut self,
        account_id: AccountId,
        birthday: BlockHeight,
        birthday_hash: BlockHash,
    ) -> Result<AccountMeta, StoreError> {
        let tx = self.transaction()?;
        let meta = register_account(&tx, account_id, birthday, birthday_hash)?;
        tx.commit()?;
        Ok(meta)
    }

    /// Returns the account's metadata record, or `None` if the account has
    /// never been registered.
    pub fn get_account_meta(&self, account_id: AccountId) -> Result<Option<AccountMeta>, StoreError> {
        get_account_meta(&self.conn, account_id)
    }

    /// Returns the account's notes that no observed spend refers to, in
    /// discovery height order.
    pub fn get_spendable_notes(&self, account_id: AccountId) -> Result<Vec<Note>, StoreError> {
        get_spendable_notes(&self.conn, account_id)
    }

    /// Returns the spend markers recorded for the account, in spend height
    /// order.
    pub fn get_nullifiers(&self, account_id: AccountId) -> Result<Vec<NoteSpend>, StoreError> {
        get_nullifiers(&self.conn, account_id)
    }
}

fn init(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;
    match schema_version(&tx)? {
        None => {
            set_schema_version(&tx, 1)?;
            create_schema(&tx)?;
            set_schema_version(&tx, SCHEMA_VERSION)?;
            debug!(version = SCHEMA_VERSION, "Created database schema");
        }
        Some(1) => {
            create_schema(&tx)?;
            set_schema_version(&tx, SCHEMA_VERSION)?;
            debug!(version = SCHEMA_VERSION, "Migrated database schema");
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => return Err(StoreError::UnsupportedSchemaVersion(other)),
    }
    tx.commit()?;
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<Option<u32>, StoreError> {
    conn.query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
        row.get::<_, u32>(0)
    })
    .optional()
    .map_err(StoreError::from)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('version', :version)
         ON CONFLICT (key) DO UPDATE SET value = :version",
        named_params! {":version": version},
    )?;
    Ok(())
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            block_id INTEGER NOT NULL,
            nullifier BLOB NOT NULL,
            UNIQUE (nullifier, account_id)
        );
        CREATE TABLE IF NOT EXISTS spent_notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            spent_block_id INTEGER NOT NULL,
            nullifier BLOB NOT NULL,
            UNIQUE (nullifier, account_id)
        );
        CREATE TABLE IF NOT EXISTS account_meta (
            account_id TEXT PRIMARY KEY,
            account_birthday INTEGER NOT NULL,
            latest_scanned_block INTEGER NOT NULL,
            latest_scanned_block_hash TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS shard_tree (
            account_id TEXT NOT NULL,
            shard_index INTEGER NOT NULL,
            subtree_end_height INTEGER,
            root_hash BLOB,
            shard_data BLOB,
            contains_marked INTEGER,
            UNIQUE (shard_index, account_id),
            UNIQUE (root_hash, account_id)
        );
        CREATE TABLE IF NOT EXISTS checkpoints (
            account_id TEXT NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            position INTEGER,
            PRIMARY KEY (checkpoint_id, account_id)
        );
        CREATE TABLE IF NOT EXISTS checkpoints_mark_removed (
            account_id TEXT NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            mark_removed_position INTEGER NOT NULL,
            FOREIGN KEY (checkpoint_id, account_id)
                REFERENCES checkpoints (checkpoint_id, account_id)
                ON DELETE CASCADE,
            UNIQUE (checkpoint_id, mark_removed_position, account_id)
        );",
    )?;
    Ok(())
}

fn account_id_text(account_id: AccountId) -> String {
    account_id.expose_uuid().to_string()
}

fn read_height(value: i64, context: &str) -> Result<BlockHeight, StoreError> {
    u32::try_from(value)
        .map(BlockHeight::from_u32)
        .map_err(|_| {
            StoreError::Format(format!(
                "{} {} is outside the representable height range",
                context, value
            ))
        })
}

fn read_amount(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Format(format!("Stored note value {} is negative", value)))
}

fn read_nullifier(bytes: &[u8]) -> Result<Nullifier, StoreError> {
    Nullifier::try_from_slice(bytes).ok_or_else(|| {
        StoreError::Format(format!(
            "Stored nullifier has invalid length {}",
            bytes.len()
        ))
    })
}

pub(crate) fn register_account(
    conn: &Transaction,
    account_id: AccountId,
    birthday: BlockHeight,
    birthday_hash: BlockHash,
) -> Result<AccountMeta, StoreError> {
    if get_account_meta(conn, account_id)?.is_some() {
        return Err(StoreError::AccountAlreadyRegistered(account_id));
    }
    conn.execute(
        "INSERT INTO account_meta
            (account_id, account_birthday, latest_scanned_block, latest_scanned_block_hash)
         VALUES (:account_id, :birthday, :latest, :hash)",
        named_params! {
            ":account_id": account_id_text(account_id),
            ":birthday": u32::from(birthday),
            ":latest": u32::from(birthday),
            ":hash": birthday_hash.to_hex(),
        },
    )?;
    Ok(AccountMeta {
        account_id,
        birthday,
        latest_scanned_block: birthday,
        latest_scanned_block_hash: birthday_hash,
    })
}

pub(crate) fn get_account_meta(
    conn: &Connection,
    account_id: AccountId,
) -> Result<Option<AccountMeta>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT account_birthday, latest_scanned_block, latest_scanned_block_hash
         FROM account_meta
         WHERE account_id = :account_id",
    )?;
    let row = stmt
        .query_row(
            named_params! {":account_id": account_id_text(account_id)},
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(birthday, latest, hash)| {
        let birthday = read_height(birthday, "Account birthday")?;
        let latest_scanned_block = read_height(latest, "Latest scanned block")?;
        let latest_scanned_block_hash = BlockHash::from_hex(&hash).ok_or_else(|| {
            StoreError::Format(format!(
                "Malformed latest scanned block hash for account {}",
                account_id
            ))
        })?;
        if latest_scanned_block < birthday {
            return Err(StoreError::Consistency(format!(
                "Latest scanned block {} of account {} precedes its birthday {}",
                latest_scanned_block, account_id, birthday
            )));
        }
        Ok(AccountMeta {
            account_id,
            birthday,
            latest_scanned_block,
            latest_scanned_block_hash,
        })
    })
    .transpose()
}

pub(crate) fn insert_notes(
    conn: &Transaction,
    account_id: AccountId,
    notes: &[Note],
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO notes (account_id, amount, block_id, nullifier)
         VALUES (:account_id, :amount, :block_id, :nullifier)",
    )?;
    for note in notes {
        let amount = i64::try_from(note.amount).map_err(|_| {
            StoreError::Format(format!(
                "Note value {} exceeds the storable range",
                note.amount
            ))
        })?;
        stmt.execute(named_params! {
            ":account_id": account_id_text(account_id),
            ":amount": amount,
            ":block_id": u32::from(note.height),
            ":nullifier": note.nullifier.0.as_slice(),
        })?;
    }
    Ok(())
}

pub(crate) fn insert_spends(
    conn: &Transaction,
    account_id: AccountId,
    spends: &[NoteSpend],
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO spent_notes (account_id, spent_block_id, nullifier)
         VALUES (:account_id, :spent_block_id, :nullifier)",
    )?;
    for spend in spends {
        stmt.execute(named_params! {
            ":account_id": account_id_text(account_id),
            ":spent_block_id": u32::from(spend.height),
            ":nullifier": spend.nullifier.0.as_slice(),
        })?;
    }
    Ok(())
}

pub(crate) fn update_latest_scanned_block(
    conn: &Transaction,
    account_id: AccountId,
    height: BlockHeight,
    hash: BlockHash,
) -> Result<(), StoreError> {
    let affected = conn.execute(
        "UPDATE account_meta
         SET latest_scanned_block = :height, latest_scanned_block_hash = :hash
         WHERE account_id = :account_id",
        named_params! {
            ":account_id": account_id_text(account_id),
            ":height": u32::from(height),
            ":hash": hash.to_hex(),
        },
    )?;
    if affected == 0 {
        return Err(StoreError::AccountNotFound(account_id));
    }
    Ok(())
}

pub(crate) fn delete_notes_above(
    conn: &Transaction,
    account_id: AccountId,
    height: BlockHeight,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM notes WHERE account_id = :account_id AND block_id > :height",
        named_params! {
            ":account_id": account_id_text(account_id),
            ":height": u32::from(height),
        },
    )?;
    conn.execute(
        "DELETE FROM spent_notes WHERE account_id = :account_id AND spent_block_id > :height",
        named_params! {
            ":account_id": account_id_text(account_id),
            ":height": u32::from(height),
        },
    )?;
    Ok(())
}

pub(crate) fn get_spendable_notes(
    conn: &Connection,
    account_id: AccountId,
) -> Result<Vec<Note>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT notes.amount, notes.block_id, notes.nullifier
         FROM notes
         LEFT OUTER JOIN spent_notes
            ON notes.nullifier = spent_notes.nullifier
            AND notes.account_id = spent_notes.account_id
         WHERE spent_notes.nullifier IS NULL
         AND notes.account_id = :account_id
         ORDER BY notes.block_id",
    )?;
    let rows = stmt.query_map(
        named_params! {":account_id": account_id_text(account_id)},
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        },
    )?;

    let mut notes = vec![];
    for row in rows {
        let (amount, height, nullifier) = row?;
        notes.push(Note {
            height: read_height(height, "Note block")?,
            amount: read_amount(amount)?,
            nullifier: read_nullifier(&nullifier)?,
        });
    }
    Ok(notes)
}

pub(crate) fn get_nullifiers(
    conn: &Connection,
    account_id: AccountId,
) -> Result<Vec<NoteSpend>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT spent_block_id, nullifier
         FROM spent_notes
         WHERE account_id = :account_id
         ORDER BY spent_block_id",
    )?;
    let rows = stmt.query_map(
        named_params! {":account_id": account_id_text(account_id)},
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
    )?;

    let mut spends = vec![];
    for row in rows {
        let (height, nullifier) = row?;
        spends.push(NoteSpend {
            height: read_height(height, "Spend block")?,
            nullifier: read_nullifier(&nullifier)?,
        });
    }
    Ok(spends)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rusqlite::named_params;
    use tempfile::NamedTempFile;

    use super::{
        delete_notes_above, insert_notes, insert_spends, update_latest_scanned_block, Storage,
    };
    use crate::error::StoreError;
    use crate::{AccountId, BlockHash, BlockHeight, Note, NoteSpend, Nullifier};

    fn test_storage() -> (NamedTempFile, Storage) {
        let file = NamedTempFile::new().unwrap();
        let storage = Storage::for_path(file.path()).unwrap();
        (file, storage)
    }

    fn h(height: u32) -> BlockHeight {
        BlockHeight::from_u32(height)
    }

    fn note(height: u32, amount: u64, tag: u8) -> Note {
        Note {
            height: h(height),
            amount,
            nullifier: Nullifier([tag; 32]),
        }
    }

    #[test]
    fn registration_always_fails_for_an_existing_account() {
        let (_file, mut storage) = test_storage();
        let account = AccountId::random();
        let meta = storage
            .register_account(account, h(100), BlockHash([1; 32]))
            .unwrap();
        assert_eq!(meta.birthday, h(100));
        assert_eq!(meta.latest_scanned_block, h(100));
        assert_eq!(meta.latest_scanned_block_hash, BlockHash([1; 32]));

        // Identical parameters do not make re-registration acceptable.
        assert_matches!(
            storage.register_account(account, h(100), BlockHash([1; 32])),
            Err(StoreError::AccountAlreadyRegistered(id)) if id == account
        );
        assert_eq!(storage.get_account_meta(account).unwrap(), Some(meta));
    }

    #[test]
    fn unknown_account_has_no_metadata() {
        let (_file, storage) = test_storage();
        assert_eq!(storage.get_account_meta(AccountId::random()).unwrap(), None);
    }

    #[test]
    fn note_and_spend_round_trip() {
        let (_file, mut storage) = test_storage();
        let account = AccountId::random();
        storage
            .register_account(account, h(100), BlockHash([1; 32]))
            .unwrap();

        let note_a = note(101, 500, 0xa1);
        let note_b = note(102, 700, 0xb2);
        let tx = storage.transaction().unwrap();
        insert_notes(&tx, account, &[note_a, note_b]).unwrap();
        update_latest_scanned_block(&tx, account, h(102), BlockHash([2; 32])).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            storage.get_spendable_notes(account).unwrap(),
            vec![note_a, note_b]
        );
        assert!(storage.get_nullifiers(account).unwrap().is_empty());

        // Spending note A removes it from the spendable set.
        let spend_a = NoteSpend {
            height: h(103),
            nullifier: note_a.nullifier,
        };
        let tx = storage.transaction().unwrap();
        insert_spends(&tx, account, &[spend_a]).unwrap();
        update_latest_scanned_block(&tx, account, h(103), BlockHash([3; 32])).unwrap();
        tx.commit().unwrap();

        assert_eq!(storage.get_spendable_notes(account).unwrap(), vec![note_b]);
        assert_eq!(storage.get_nullifiers(account).unwrap(), vec![spend_a]);

        let meta = storage.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.latest_scanned_block, h(103));
        assert_eq!(meta.latest_scanned_block_hash, BlockHash([3; 32]));
    }

    #[test]
    fn reorg_truncation_preserves_other_accounts() {
        let (_file, mut storage) = test_storage();
        let account_a = AccountId::random();
        let account_b = AccountId::random();
        storage
            .register_account(account_a, h(100), BlockHash([1; 32]))
            .unwrap();
        storage
            .register_account(account_b, h(100), BlockHash([1; 32]))
            .unwrap();

        let tx = storage.transaction().unwrap();
        insert_notes(
            &tx,
            account_a,
            &[
                note(101, 10, 0x01),
                note(102, 20, 0x02),
                note(103, 30, 0x03),
                note(104, 40, 0x04),
            ],
        )
        .unwrap();
        insert_spends(
            &tx,
            account_a,
            &[NoteSpend {
                height: h(103),
                nullifier: Nullifier([0x01; 32]),
            }],
        )
        .unwrap();
        update_latest_scanned_block(&tx, account_a, h(104), BlockHash([4; 32])).unwrap();
        insert_notes(&tx, account_b, &[note(104, 99, 0x21)]).unwrap();
        update_latest_scanned_block(&tx, account_b, h(104), BlockHash([4; 32])).unwrap();
        tx.commit().unwrap();

        // Roll account A back to height 101.
        let tx = storage.transaction().unwrap();
        delete_notes_above(&tx, account_a, h(101)).unwrap();
        update_latest_scanned_block(&tx, account_a, h(101), BlockHash([9; 32])).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            storage.get_spendable_notes(account_a).unwrap(),
            vec![note(101, 10, 0x01)]
        );
        assert!(storage.get_nullifiers(account_a).unwrap().is_empty());
        let meta_a = storage.get_account_meta(account_a).unwrap().unwrap();
        assert_eq!(meta_a.latest_scanned_block, h(101));
        assert_eq!(meta_a.latest_scanned_block_hash, BlockHash([9; 32]));

        // Account B is untouched.
        assert_eq!(
            storage.get_spendable_notes(account_b).unwrap(),
            vec![note(104, 99, 0x21)]
        );
        let meta_b = storage.get_account_meta(account_b).unwrap().unwrap();
        assert_eq!(meta_b.latest_scanned_block, h(104));
    }

    #[test]
    fn negative_stored_amount_is_a_format_error() {
        let (_file, mut storage) = test_storage();
        let account = AccountId::random();
        storage
            .register_account(account, h(100), BlockHash([1; 32]))
            .unwrap();

        let tx = storage.transaction().unwrap();
        tx.execute(
            "INSERT INTO notes (account_id, amount, block_id, nullifier)
             VALUES (:account_id, -5, 101, :nullifier)",
            named_params! {
                ":account_id": account.expose_uuid().to_string(),
                ":nullifier": [7u8; 32].as_slice(),
            },
        )
        .unwrap();
        tx.commit().unwrap();

        assert_matches!(
            storage.get_spendable_notes(account),
            Err(StoreError::Format(_))
        );
    }

    #[test]
    fn metadata_behind_birthday_is_a_consistency_error() {
        let (_file, mut storage) = test_storage();
        let account = AccountId::random();
        storage
            .register_account(account, h(100), BlockHash([1; 32]))
            .unwrap();

        let tx = storage.transaction().unwrap();
        tx.execute(
            "UPDATE account_meta SET latest_scanned_block = 50 WHERE account_id = :account_id",
            named_params! {":account_id": account.expose_uuid().to_string()},
        )
        .unwrap();
        tx.commit().unwrap();

        assert_matches!(
            storage.get_account_meta(account),
            Err(StoreError::Consistency(_))
        );
    }

    #[test]
    fn storage_reopens_existing_database() {
        let file = NamedTempFile::new().unwrap();
        let account = AccountId::random();
        {
            let mut storage = Storage::for_path(file.path()).unwrap();
            storage
                .register_account(account, h(100), BlockHash([1; 32]))
                .unwrap();
        }

        let storage = Storage::for_path(file.path()).unwrap();
        let meta = storage.get_account_meta(account).unwrap().unwrap();
        assert_eq!(meta.birthday, h(100));
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut storage = Storage::for_path(file.path()).unwrap();
            let tx = storage.transaction().unwrap();
            tx.execute("UPDATE meta SET value = 99 WHERE key = 'version'", [])
                .unwrap();
            tx.commit().unwrap();
        }

        assert_matches!(
            Storage::for_path(file.path()),
            Err(StoreError::UnsupportedSchemaVersion(99))
        );
    }
}
