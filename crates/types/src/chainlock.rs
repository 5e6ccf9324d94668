//! Chain-lock signature types and their canonical encoding.
//!
//! This module defines the value types exchanged between the chain-lock
//! handler and the quorum signing layer:
//! - [`ChainLockSig`] - the CLSIG wire message certifying a block as final
//! - [`RecoveredSig`] - a recovered threshold signature delivered by the
//!   signing layer
//! - [`BlsSignature`] - opaque threshold-signature container
//! - [`chain_lock_request_id`] - the deterministic signing request id
//!
//! ## Canonical encoding
//!
//! A CLSIG is RLP-encoded as the list `[height, block_hash, signature]` and
//! its canonical hash is the Keccak256 of that encoding. The same bytes go
//! over the wire, into the inventory hash used for relay, and into the
//! dedup cache, so encode → decode → encode is byte-identical by
//! construction.

use crate::hash::{keccak256_concat, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Size of a threshold signature in bytes (BLS12-381 G2 point).
pub const BLS_SIGNATURE_SIZE: usize = 96;

/// Height sentinel meaning "no chain lock".
pub const NULL_HEIGHT: i32 = -1;

/// Prefix bound into every chain-lock signing request id.
pub const CLSIG_REQUEST_PREFIX: &[u8] = b"clsig";

/// Opaque threshold signature produced by a masternode quorum.
///
/// The chain-lock subsystem never performs curve math on this value; it is
/// carried as bytes and handed to the external signing layer for
/// verification.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlsSignature([u8; BLS_SIGNATURE_SIZE]);

impl BlsSignature {
    /// Creates a signature from a 96-byte array.
    #[inline]
    pub const fn new(bytes: [u8; BLS_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a signature from a slice.
    ///
    /// Returns an error if the slice length is not exactly 96 bytes.
    pub fn from_slice(slice: &[u8]) -> crate::Result<Self> {
        if slice.len() != BLS_SIGNATURE_SIZE {
            return Err(crate::Error::InvalidLength {
                expected: BLS_SIGNATURE_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; BLS_SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Returns the signature as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks if this is the all-zero (null) signature.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for BlsSignature {
    fn default() -> Self {
        Self([0u8; BLS_SIGNATURE_SIZE])
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature(0x{}..)", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for BlsSignature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for BlsSignature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl Encodable for BlsSignature {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for BlsSignature {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        if bytes.len() != BLS_SIGNATURE_SIZE {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut arr = [0u8; BLS_SIGNATURE_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Quorum family that signs chain locks.
///
/// The handler treats this as an opaque tag passed through to the signing
/// layer; quorum selection itself lives outside this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuorumType(pub u8);

impl fmt::Display for QuorumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quorum-{}", self.0)
    }
}

/// Chain-lock signature: a threshold signature certifying that the block at
/// `height` with hash `block_hash` is final.
///
/// Two CLSIGs are equal iff all three fields match. The default value is the
/// null lock (`height == -1`), which every node starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLockSig {
    /// Height of the locked block; [`NULL_HEIGHT`] when unset.
    pub height: i32,
    /// Hash of the locked block.
    pub block_hash: H256,
    /// Threshold signature over the signing request.
    pub signature: BlsSignature,
}

impl ChainLockSig {
    /// Creates a new chain-lock signature.
    pub fn new(height: i32, block_hash: H256, signature: BlsSignature) -> Self {
        Self {
            height,
            block_hash,
            signature,
        }
    }

    /// Checks whether this is the null lock (no block referenced).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.height == NULL_HEIGHT
    }

    /// Canonical RLP encoding of this CLSIG.
    ///
    /// RLP carries no signed integers, so the height crosses the wire as its
    /// two's-complement `u32` image (`-1` encodes as `0xffffffff`).
    pub fn rlp_encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(3);
        stream.append(&(self.height as u32));
        stream.append(&self.block_hash);
        stream.append(&self.signature);
        stream.out().to_vec()
    }

    /// Decodes a CLSIG from its canonical encoding.
    pub fn rlp_decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(rlp::decode(bytes)?)
    }

    /// Canonical hash of this CLSIG: Keccak256 over the canonical encoding.
    ///
    /// This hash is the inventory payload used for relay and the dedup key.
    pub fn hash(&self) -> H256 {
        H256::keccak256(&self.rlp_encode())
    }
}

impl Default for ChainLockSig {
    fn default() -> Self {
        Self {
            height: NULL_HEIGHT,
            block_hash: H256::NIL,
            signature: BlsSignature::default(),
        }
    }
}

impl fmt::Display for ChainLockSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChainLockSig(height={}, block_hash={})",
            self.height, self.block_hash
        )
    }
}

impl Encodable for ChainLockSig {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&(self.height as u32));
        s.append(&self.block_hash);
        s.append(&self.signature);
    }
}

impl Decodable for ChainLockSig {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let height: u32 = rlp.val_at(0)?;
        Ok(Self {
            height: height as i32,
            block_hash: rlp.val_at(1)?,
            signature: rlp.val_at(2)?,
        })
    }
}

/// A recovered threshold signature as delivered by the quorum signing layer.
///
/// The chain-lock handler matches `(request_id, msg_hash)` against its
/// pending signing proposal; recovered signatures belonging to other
/// subsystems simply fail the match and are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredSig {
    /// Id of the signing request this signature answers.
    pub request_id: H256,
    /// Message hash that was signed (the block hash for chain locks).
    pub msg_hash: H256,
    /// The recovered threshold signature.
    pub signature: BlsSignature,
}

/// Deterministic signing request id for a chain lock at `height`.
///
/// `Keccak256("clsig" ‖ height_le)` - every honest masternode at the same
/// height derives the same id, which is what lets the quorum aggregate
/// partial signatures into one recovered signature.
pub fn chain_lock_request_id(height: i32) -> H256 {
    keccak256_concat(&[CLSIG_REQUEST_PREFIX, &height.to_le_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_clsig() -> ChainLockSig {
        ChainLockSig::new(
            42,
            H256::keccak256(b"block at 42"),
            BlsSignature::new([7u8; BLS_SIGNATURE_SIZE]),
        )
    }

    #[test]
    fn test_null_lock() {
        let clsig = ChainLockSig::default();
        assert!(clsig.is_null());
        assert_eq!(clsig.height, NULL_HEIGHT);
        assert!(clsig.block_hash.is_nil());
        assert!(clsig.signature.is_null());
    }

    #[test]
    fn test_encode_roundtrip_is_byte_identical() {
        let clsig = test_clsig();
        let encoded = clsig.rlp_encode();
        let decoded = ChainLockSig::rlp_decode(&encoded).unwrap();
        assert_eq!(decoded, clsig);
        assert_eq!(decoded.rlp_encode(), encoded);
    }

    #[test]
    fn test_null_height_roundtrip() {
        let clsig = ChainLockSig::default();
        let decoded = ChainLockSig::rlp_decode(&clsig.rlp_encode()).unwrap();
        assert_eq!(decoded.height, NULL_HEIGHT);
        assert!(decoded.is_null());
    }

    #[test]
    fn test_hash_covers_all_fields() {
        let base = test_clsig();
        let mut other = base.clone();
        other.height += 1;
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.block_hash = H256::keccak256(b"different");
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.signature = BlsSignature::new([9u8; BLS_SIGNATURE_SIZE]);
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn test_hash_matches_decoded_hash() {
        let clsig = test_clsig();
        let decoded = ChainLockSig::rlp_decode(&clsig.rlp_encode()).unwrap();
        assert_eq!(clsig.hash(), decoded.hash());
    }

    #[test]
    fn test_request_id_deterministic() {
        assert_eq!(chain_lock_request_id(10), chain_lock_request_id(10));
        assert_ne!(chain_lock_request_id(10), chain_lock_request_id(11));
    }

    #[test]
    fn test_request_id_prefix_bound() {
        // Same bytes without the prefix must not collide with the request id.
        let raw = H256::keccak256(&10i32.to_le_bytes());
        assert_ne!(chain_lock_request_id(10), raw);
    }

    #[test]
    fn test_signature_from_slice_length() {
        assert!(BlsSignature::from_slice(&[0u8; 95]).is_err());
        assert!(BlsSignature::from_slice(&[0u8; 96]).is_ok());
    }

    #[test]
    fn test_clsig_serde() {
        let clsig = test_clsig();
        let json = serde_json::to_string(&clsig).unwrap();
        let decoded: ChainLockSig = serde_json::from_str(&json).unwrap();
        assert_eq!(clsig, decoded);
    }

    #[test]
    fn test_decode_rejects_wrong_list_len() {
        let mut stream = RlpStream::new_list(2);
        stream.append(&1u32);
        stream.append(&H256::NIL);
        assert!(ChainLockSig::rlp_decode(&stream.out()).is_err());
    }
}
