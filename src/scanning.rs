//! Tools for scanning a compact representation of the block chain.
//!
//! The scanner walks an ordered run of compact blocks, checks them for
//! continuity against the chain state at which the run begins, trial-decrypts
//! every shielded action with the account's viewing key, and assembles the
//! note commitments into a batch that can be appended to the account's note
//! commitment tree. It performs no database access and holds no locks, so it is
//! suitable for execution on a blocking worker.

use std::fmt;

use blake2b_simd::Params;
use incrementalmerkletree::Retention;
use secrecy::{ExposeSecret, SecretVec};
use subtle::ConstantTimeEq;

use crate::client::ChainState;
use crate::proto::{CompactAction, CompactBlock};
use crate::tree::NodeHash;
use crate::{BlockHash, BlockHeight, Note, NoteSpend, Nullifier};

const KDF_PERSONALIZATION: &[u8; 16] = b"ShieldSyncDerive";
const CIPHER_PERSONALIZATION: &[u8; 16] = b"ShieldSyncCipher";
const COMMITMENT_PERSONALIZATION: &[u8; 16] = b"ShieldSyncCommit";
const NULLIFIER_PERSONALIZATION: &[u8; 16] = b"ShieldSyncNullif";

/// The length of the compact (truncated) action ciphertext.
pub const COMPACT_CIPHERTEXT_SIZE: usize = 52;

const NOTE_PLAINTEXT_VERSION: u8 = 0x02;

/// Errors that may occur in chain scanning.
#[derive(Clone, Debug)]
pub enum ScanError {
    /// The downloaded block data was structurally unusable. The whole batch is
    /// rejected; no prefix of it is applied.
    Input(InputError),
    /// The supplied key material could not be used for trial decryption.
    Decoder(DecoderError),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Input(e) => write!(f, "Invalid block input: {}", e),
            ScanError::Decoder(e) => write!(f, "Key material could not be decoded: {}", e),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<InputError> for ScanError {
    fn from(e: InputError) -> Self {
        ScanError::Input(e)
    }
}

impl From<DecoderError> for ScanError {
    fn from(e: DecoderError) -> Self {
        ScanError::Decoder(e)
    }
}

/// Structural defects in a run of compact blocks.
#[derive(Clone, Debug)]
pub enum InputError {
    /// The hash of the parent block given by a proposed new block does not
    /// match the hash of the block that precedes it in the scanned run.
    PrevHashMismatch {
        at_height: BlockHeight,
    },
    /// The block height field of the proposed new block is not equal to the
    /// height of the previous block plus one.
    BlockHeightDiscontinuity {
        prev_height: BlockHeight,
        new_height: BlockHeight,
    },
    /// A block's encoded height cannot be represented as a block height.
    HeightOutOfRange {
        encoded: u64,
    },
    /// A block hash field did not have the expected width.
    InvalidBlockHash {
        at_height: BlockHeight,
    },
    /// An action field did not have the protocol-fixed width.
    MalformedAction {
        at_height: BlockHeight,
        field: &'static str,
        length: usize,
    },
    /// The note commitment tree size declared for a block does not match the
    /// size computed from the preceding state plus the block's own actions.
    TreeSizeMismatch {
        at_height: BlockHeight,
        given: u64,
        computed: u64,
    },
    /// The computed note commitment tree size overflowed.
    TreeSizeInvalid {
        at_height: BlockHeight,
    },
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::PrevHashMismatch { at_height } => write!(
                f,
                "The parent hash of the block at height {} does not match the scanned predecessor",
                at_height
            ),
            InputError::BlockHeightDiscontinuity {
                prev_height,
                new_height,
            } => write!(
                f,
                "Block height discontinuity at height {}; next height is {}",
                prev_height, new_height
            ),
            InputError::HeightOutOfRange { encoded } => {
                write!(f, "Block height {} is out of range", encoded)
            }
            InputError::InvalidBlockHash { at_height } => {
                write!(f, "A block hash at height {} has an invalid width", at_height)
            }
            InputError::MalformedAction {
                at_height,
                field,
                length,
            } => write!(
                f,
                "An action at height {} has a malformed {} field of length {}",
                at_height, field, length
            ),
            InputError::TreeSizeMismatch {
                at_height,
                given,
                computed,
            } => write!(
                f,
                "The block at height {} declares a tree size of {} but {} was computed",
                at_height, given, computed
            ),
            InputError::TreeSizeInvalid { at_height } => write!(
                f,
                "The note commitment tree size overflowed at height {}",
                at_height
            ),
        }
    }
}

/// Defects in the key material supplied to the scanner.
#[derive(Clone, Debug)]
pub enum DecoderError {
    /// The serialized key did not have the expected length.
    InvalidKeyLength { expected: usize, actual: usize },
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderError::InvalidKeyLength { expected, actual } => write!(
                f,
                "Expected a viewing key of {} bytes, got {}",
                expected, actual
            ),
        }
    }
}

/// The viewing key material used to trial-decrypt compact actions.
///
/// The key carries an incoming viewing key, which recovers note plaintexts,
/// and a nullifier-deriving key, which computes the nullifiers of recovered
/// notes so that their spends can later be recognized.
#[derive(Clone, Debug)]
pub struct ScanningKey {
    ivk: [u8; 32],
    nk: [u8; 32],
}

impl ScanningKey {
    /// The serialized length of a scanning key: the incoming viewing key
    /// followed by the nullifier-deriving key.
    pub const LENGTH: usize = 64;

    /// Parses a scanning key from its 64-byte serialized form.
    pub fn from_bytes(bytes: &SecretVec<u8>) -> Result<Self, DecoderError> {
        let raw = bytes.expose_secret();
        if raw.len() != Self::LENGTH {
            return Err(DecoderError::InvalidKeyLength {
                expected: Self::LENGTH,
                actual: raw.len(),
            });
        }
        let mut ivk = [0u8; 32];
        ivk.copy_from_slice(&raw[..32]);
        let mut nk = [0u8; 32];
        nk.copy_from_slice(&raw[32..]);
        Ok(ScanningKey { ivk, nk })
    }

    /// Assembles a scanning key from its component keys.
    pub fn from_parts(ivk: [u8; 32], nk: [u8; 32]) -> Self {
        ScanningKey { ivk, nk }
    }
}

/// The outcome of scanning a run of compact blocks.
#[derive(Clone, Debug)]
pub struct ScanResult {
    chain_state: ChainState,
    received_notes: Vec<Note>,
    spends: Vec<NoteSpend>,
    note_commitments: Vec<(NodeHash, Retention<BlockHeight>)>,
    last_scanned_height: BlockHeight,
    last_scanned_hash: BlockHash,
}

impl ScanResult {
    /// Assembles a scan result from its constituent parts.
    pub fn from_parts(
        chain_state: ChainState,
        received_notes: Vec<Note>,
        spends: Vec<NoteSpend>,
        note_commitments: Vec<(NodeHash, Retention<BlockHeight>)>,
        last_scanned_height: BlockHeight,
        last_scanned_hash: BlockHash,
    ) -> Self {
        ScanResult {
            chain_state,
            received_notes,
            spends,
            note_commitments,
            last_scanned_height,
            last_scanned_hash,
        }
    }

    /// The chain state at which the scanned run begins.
    pub fn chain_state(&self) -> &ChainState {
        &self.chain_state
    }

    /// The notes received by the account within the scanned run.
    pub fn received_notes(&self) -> &[Note] {
        &self.received_notes
    }

    /// Every spend marker observed in the scanned run, whether or not it
    /// corresponds to a note of the account. Filtering against the known note
    /// set is the caller's responsibility.
    pub fn spends(&self) -> &[NoteSpend] {
        &self.spends
    }

    /// The note commitments of the scanned run, in position order, paired with
    /// their tree retention.
    pub fn note_commitments(&self) -> &[(NodeHash, Retention<BlockHeight>)] {
        &self.note_commitments
    }

    /// The height of the last block in the scanned run.
    pub fn last_scanned_height(&self) -> BlockHeight {
        self.last_scanned_height
    }

    /// The hash of the last block in the scanned run.
    pub fn last_scanned_hash(&self) -> BlockHash {
        self.last_scanned_hash
    }

    /// Decomposes this result into the starting chain state and the note
    /// commitment batch.
    pub fn into_commitments(self) -> (ChainState, Vec<(NodeHash, Retention<BlockHeight>)>) {
        (self.chain_state, self.note_commitments)
    }
}

struct ParsedAction {
    nullifier: [u8; 32],
    cmx: [u8; 32],
    ephemeral_key: [u8; 32],
    ciphertext: [u8; COMPACT_CIPHERTEXT_SIZE],
}

/// Scans an ordered run of compact blocks with the given key.
///
/// `chain_state` must describe the block immediately preceding `blocks`; the
/// first scanned block is checked against its height and hash, and the note
/// commitments of the run are positioned immediately after its tree size.
pub fn scan_blocks(
    key: &ScanningKey,
    chain_state: ChainState,
    blocks: Vec<CompactBlock>,
) -> Result<ScanResult, ScanError> {
    let mut prior_height = chain_state.block_height();
    let mut prior_hash = chain_state.block_hash();
    let mut tree_size = chain_state.tree_size();

    let mut received_notes = vec![];
    let mut spends = vec![];
    let mut note_commitments = vec![];

    for block in &blocks {
        let cur_height = block.height().ok_or(InputError::HeightOutOfRange {
            encoded: block.height,
        })?;
        if cur_height != prior_height + 1 {
            return Err(InputError::BlockHeightDiscontinuity {
                prev_height: prior_height,
                new_height: cur_height,
            }
            .into());
        }
        let cur_hash = block.hash().ok_or(InputError::InvalidBlockHash {
            at_height: cur_height,
        })?;
        let prev_hash = block.prev_hash().ok_or(InputError::InvalidBlockHash {
            at_height: cur_height,
        })?;
        if prev_hash != prior_hash {
            return Err(InputError::PrevHashMismatch {
                at_height: cur_height,
            }
            .into());
        }

        let block_action_count = block.action_count();
        let mut action_idx = 0usize;
        for tx in &block.vtx {
            for action in &tx.actions {
                let action = parse_compact_action(action, cur_height)?;

                // Every revealed nullifier is recorded; whether it spends one
                // of the account's notes is decided against the full note set
                // when the scan result is applied.
                spends.push(NoteSpend {
                    height: cur_height,
                    nullifier: Nullifier(action.nullifier),
                });

                let decrypted = try_compact_note_decryption(key, &action);
                if let Some((value, rseed)) = decrypted {
                    received_notes.push(Note {
                        height: cur_height,
                        amount: value,
                        nullifier: note_nullifier(key, &action.nullifier, &rseed),
                    });
                }

                // The last commitment of each block carries a checkpoint
                // identified by the block height, preserving the tree state at
                // every scanned block boundary.
                let is_checkpoint = action_idx + 1 == block_action_count;
                let retention = match (decrypted.is_some(), is_checkpoint) {
                    (is_marked, true) => Retention::Checkpoint {
                        id: cur_height,
                        is_marked,
                    },
                    (true, false) => Retention::Marked,
                    (false, false) => Retention::Ephemeral,
                };
                note_commitments.push((NodeHash::from_bytes(action.cmx), retention));
                action_idx += 1;
            }
        }

        let computed_size = u64::try_from(block_action_count)
            .ok()
            .and_then(|count| tree_size.checked_add(count))
            .ok_or(InputError::TreeSizeInvalid {
                at_height: cur_height,
            })?;
        if let Some(metadata) = &block.chain_metadata {
            let given = u64::from(metadata.commitment_tree_size);
            if given != computed_size {
                return Err(InputError::TreeSizeMismatch {
                    at_height: cur_height,
                    given,
                    computed: computed_size,
                }
                .into());
            }
        }

        tree_size = computed_size;
        prior_height = cur_height;
        prior_hash = cur_hash;
    }

    Ok(ScanResult {
        chain_state,
        received_notes,
        spends,
        note_commitments,
        last_scanned_height: prior_height,
        last_scanned_hash: prior_hash,
    })
}

fn parse_compact_action(
    action: &CompactAction,
    at_height: BlockHeight,
) -> Result<ParsedAction, ScanError> {
    fn fixed<const N: usize>(
        bytes: &[u8],
        field: &'static str,
        at_height: BlockHeight,
    ) -> Result<[u8; N], ScanError> {
        <[u8; N]>::try_from(bytes).map_err(|_| {
            ScanError::Input(InputError::MalformedAction {
                at_height,
                field,
                length: bytes.len(),
            })
        })
    }

    Ok(ParsedAction {
        nullifier: fixed(&action.nullifier, "nullifier", at_height)?,
        cmx: fixed(&action.cmx, "cmx", at_height)?,
        ephemeral_key: fixed(&action.ephemeral_key, "ephemeral key", at_height)?,
        ciphertext: fixed(&action.ciphertext, "ciphertext", at_height)?,
    })
}

/// Attempts to decrypt the compact ciphertext of an action, returning the note
/// value and rseed on success.
fn try_compact_note_decryption(key: &ScanningKey, action: &ParsedAction) -> Option<(u64, [u8; 32])> {
    let shared = blake2b_256(KDF_PERSONALIZATION, &[&key.ivk, &action.ephemeral_key]);
    let keystream = blake2b_512(CIPHER_PERSONALIZATION, &[&shared]);

    let mut plaintext = [0u8; COMPACT_CIPHERTEXT_SIZE];
    for (i, (c, k)) in action.ciphertext.iter().zip(keystream.iter()).enumerate() {
        plaintext[i] = c ^ k;
    }

    if plaintext[0] != NOTE_PLAINTEXT_VERSION {
        return None;
    }
    let value = u64::from_le_bytes(
        plaintext[12..20]
            .try_into()
            .expect("slice is exactly eight bytes"),
    );
    let mut rseed = [0u8; 32];
    rseed.copy_from_slice(&plaintext[20..52]);

    let cmx = note_commitment(&plaintext[1..12], value, &rseed, &action.ephemeral_key);
    if bool::from(cmx[..].ct_eq(&action.cmx[..])) {
        Some((value, rseed))
    } else {
        None
    }
}

fn note_commitment(
    diversifier: &[u8],
    value: u64,
    rseed: &[u8; 32],
    ephemeral_key: &[u8; 32],
) -> [u8; 32] {
    blake2b_256(
        COMMITMENT_PERSONALIZATION,
        &[diversifier, &value.to_le_bytes(), rseed, ephemeral_key],
    )
}

fn note_nullifier(key: &ScanningKey, rho: &[u8; 32], rseed: &[u8; 32]) -> Nullifier {
    Nullifier(blake2b_256(NULLIFIER_PERSONALIZATION, &[&key.nk, rho, rseed]))
}

fn blake2b_256(personal: &[u8; 16], chunks: &[&[u8]]) -> [u8; 32] {
    let mut state = Params::new().hash_length(32).personal(personal).to_state();
    for chunk in chunks {
        state.update(chunk);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

fn blake2b_512(personal: &[u8; 16], chunks: &[&[u8]]) -> [u8; 64] {
    let mut state = Params::new().hash_length(64).personal(personal).to_state();
    for chunk in chunks {
        state.update(chunk);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

#[cfg(any(test, feature = "test-dependencies"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-dependencies")))]
pub mod testing {
    //! Deterministic construction of decryptable compact blocks.

    use super::{
        blake2b_256, note_commitment, note_nullifier, ScanningKey, COMPACT_CIPHERTEXT_SIZE,
        KDF_PERSONALIZATION, CIPHER_PERSONALIZATION, NOTE_PLAINTEXT_VERSION,
    };
    use crate::proto::{ChainMetadata, CompactAction, CompactBlock, CompactTx};
    use crate::{BlockHash, BlockHeight, Nullifier};

    /// Produces the deterministic hash used for fake blocks at the given
    /// height.
    pub fn fake_block_hash(height: BlockHeight) -> BlockHash {
        BlockHash(blake2b_256(
            b"ShieldSyncFakeBk",
            &[&u32::from(height).to_le_bytes()],
        ))
    }

    /// Builds a compact action that `key` can decrypt, returning the action
    /// together with the nullifier the wallet will derive for the received
    /// note.
    ///
    /// `seed` distinguishes actions built for the same key and value.
    pub fn fake_decryptable_action(
        key: &ScanningKey,
        value: u64,
        seed: u8,
    ) -> (CompactAction, Nullifier) {
        let ephemeral_key = [seed; 32];
        let diversifier = [0x5a; 11];
        let rseed = [seed ^ 0xff; 32];
        let rho = [seed.wrapping_add(1); 32];

        let mut plaintext = [0u8; COMPACT_CIPHERTEXT_SIZE];
        plaintext[0] = NOTE_PLAINTEXT_VERSION;
        plaintext[1..12].copy_from_slice(&diversifier);
        plaintext[12..20].copy_from_slice(&value.to_le_bytes());
        plaintext[20..52].copy_from_slice(&rseed);

        let shared = blake2b_256(KDF_PERSONALIZATION, &[&key.ivk, &ephemeral_key]);
        let keystream = super::blake2b_512(CIPHER_PERSONALIZATION, &[&shared]);
        let mut ciphertext = vec![0u8; COMPACT_CIPHERTEXT_SIZE];
        for (i, (p, k)) in plaintext.iter().zip(keystream.iter()).enumerate() {
            ciphertext[i] = p ^ k;
        }

        let cmx = note_commitment(&diversifier, value, &rseed, &ephemeral_key);
        let nullifier = note_nullifier(key, &rho, &rseed);

        (
            CompactAction {
                nullifier: rho.to_vec(),
                cmx: cmx.to_vec(),
                ephemeral_key: ephemeral_key.to_vec(),
                ciphertext,
            },
            nullifier,
        )
    }

    /// Builds a compact action that no key can decrypt.
    pub fn fake_foreign_action(seed: u8) -> CompactAction {
        CompactAction {
            nullifier: [seed; 32].to_vec(),
            cmx: blake2b_256(b"ShieldSyncFakeCm", &[&[seed]]).to_vec(),
            ephemeral_key: [seed.wrapping_mul(3); 32].to_vec(),
            ciphertext: vec![seed; COMPACT_CIPHERTEXT_SIZE],
        }
    }

    /// Assembles a compact block at the given height whose hash is
    /// [`fake_block_hash`] of that height.
    pub fn fake_compact_block(
        height: BlockHeight,
        prev_hash: BlockHash,
        actions: Vec<CompactAction>,
        tree_size_at_end: Option<u32>,
    ) -> CompactBlock {
        CompactBlock {
            proto_version: 1,
            height: u64::from(height),
            hash: fake_block_hash(height).0.to_vec(),
            prev_hash: prev_hash.0.to_vec(),
            time: 0,
            vtx: vec![CompactTx {
                index: 0,
                hash: blake2b_256(b"ShieldSyncFakeTx", &[&u32::from(height).to_le_bytes()])
                    .to_vec(),
                actions,
            }],
            chain_metadata: tree_size_at_end.map(|commitment_tree_size| ChainMetadata {
                commitment_tree_size,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use incrementalmerkletree::{frontier::Frontier, Retention};
    use secrecy::SecretVec;

    use super::testing::{
        fake_block_hash, fake_compact_block, fake_decryptable_action, fake_foreign_action,
    };
    use super::{scan_blocks, DecoderError, InputError, ScanError, ScanningKey};
    use crate::client::ChainState;
    use crate::{BlockHash, BlockHeight};

    fn test_key() -> ScanningKey {
        ScanningKey::from_parts([7u8; 32], [11u8; 32])
    }

    fn empty_chain_state(height: u32) -> ChainState {
        ChainState::from_parts(
            BlockHeight::from_u32(height),
            fake_block_hash(BlockHeight::from_u32(height)),
            Frontier::empty(),
        )
    }

    #[test]
    fn scan_detects_received_note() {
        let key = test_key();
        let (own_action, expected_nf) = fake_decryptable_action(&key, 70_000, 3);
        let actions = vec![fake_foreign_action(9), own_action];
        let block = fake_compact_block(
            BlockHeight::from_u32(101),
            fake_block_hash(BlockHeight::from_u32(100)),
            actions,
            Some(2),
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![block]).unwrap();

        assert_eq!(result.received_notes().len(), 1);
        let note = result.received_notes()[0];
        assert_eq!(note.height, BlockHeight::from_u32(101));
        assert_eq!(note.amount, 70_000);
        assert_eq!(note.nullifier, expected_nf);

        // Both revealed nullifiers are recorded, not just the account's.
        assert_eq!(result.spends().len(), 2);

        // The final commitment of the block checkpoints the tree at the block
        // height, and is marked because the received note is the final action.
        assert_eq!(result.note_commitments().len(), 2);
        assert_eq!(result.note_commitments()[0].1, Retention::Ephemeral);
        assert_eq!(
            result.note_commitments()[1].1,
            Retention::Checkpoint {
                id: BlockHeight::from_u32(101),
                is_marked: true
            }
        );

        assert_eq!(result.last_scanned_height(), BlockHeight::from_u32(101));
        assert_eq!(
            result.last_scanned_hash(),
            fake_block_hash(BlockHeight::from_u32(101))
        );
    }

    #[test]
    fn scan_requires_contiguous_heights() {
        let key = test_key();
        let b101 = fake_compact_block(
            BlockHeight::from_u32(101),
            fake_block_hash(BlockHeight::from_u32(100)),
            vec![],
            None,
        );
        let b103 = fake_compact_block(
            BlockHeight::from_u32(103),
            fake_block_hash(BlockHeight::from_u32(101)),
            vec![],
            None,
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![b101, b103]);
        assert_matches!(
            result,
            Err(ScanError::Input(InputError::BlockHeightDiscontinuity { .. }))
        );
    }

    #[test]
    fn scan_requires_linking_prev_hash() {
        let key = test_key();
        let block = fake_compact_block(
            BlockHeight::from_u32(101),
            BlockHash([0xab; 32]),
            vec![],
            None,
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![block]);
        assert_matches!(
            result,
            Err(ScanError::Input(InputError::PrevHashMismatch { .. }))
        );
    }

    #[test]
    fn scan_rejects_malformed_action() {
        let key = test_key();
        let mut action = fake_foreign_action(4);
        action.nullifier.truncate(31);
        let block = fake_compact_block(
            BlockHeight::from_u32(101),
            fake_block_hash(BlockHeight::from_u32(100)),
            vec![action],
            None,
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![block]);
        assert_matches!(
            result,
            Err(ScanError::Input(InputError::MalformedAction {
                field: "nullifier",
                length: 31,
                ..
            }))
        );
    }

    #[test]
    fn scan_rejects_tree_size_mismatch() {
        let key = test_key();
        let block = fake_compact_block(
            BlockHeight::from_u32(101),
            fake_block_hash(BlockHeight::from_u32(100)),
            vec![fake_foreign_action(1), fake_foreign_action(2)],
            // Two actions from an empty tree must yield a size of two.
            Some(5),
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![block]);
        assert_matches!(
            result,
            Err(ScanError::Input(InputError::TreeSizeMismatch {
                given: 5,
                computed: 2,
                ..
            }))
        );
    }

    #[test]
    fn scanning_key_requires_exact_length() {
        let result = ScanningKey::from_bytes(&SecretVec::new(vec![0u8; 63]));
        assert_matches!(
            result,
            Err(DecoderError::InvalidKeyLength {
                expected: 64,
                actual: 63
            })
        );
    }

    #[test]
    fn foreign_actions_do_not_decrypt() {
        let key = test_key();
        let other_key = ScanningKey::from_parts([8u8; 32], [12u8; 32]);
        let (action, _) = fake_decryptable_action(&other_key, 1_000, 5);
        let block = fake_compact_block(
            BlockHeight::from_u32(101),
            fake_block_hash(BlockHeight::from_u32(100)),
            vec![action],
            Some(1),
        );

        let result = scan_blocks(&key, empty_chain_state(100), vec![block]).unwrap();
        assert!(result.received_notes().is_empty());
        assert_eq!(result.spends().len(), 1);
    }
}
