//! Tests for chain-lock signature encoding and hashing.
//!
//! These tests verify the canonical-encoding contract:
//! - encode → decode → encode is byte-identical
//! - the canonical hash is stable across the round trip
//! - request ids are deterministic and height-bound

use granite_types::{
    chain_lock_request_id, BlsSignature, ChainLockSig, H256, BLS_SIGNATURE_SIZE, NULL_HEIGHT,
};

fn create_test_clsig(height: i32, seed: u8) -> ChainLockSig {
    ChainLockSig::new(
        height,
        H256::keccak256(&[seed]),
        BlsSignature::new([seed; BLS_SIGNATURE_SIZE]),
    )
}

#[test]
fn test_roundtrip_byte_identical() {
    for height in [0, 1, 100, i32::MAX, NULL_HEIGHT] {
        let clsig = create_test_clsig(height, 3);
        let encoded = clsig.rlp_encode();
        let decoded = ChainLockSig::rlp_decode(&encoded).unwrap();
        assert_eq!(decoded, clsig);
        assert_eq!(decoded.rlp_encode(), encoded, "height {height}");
    }
}

#[test]
fn test_canonical_hash_stable_across_roundtrip() {
    let clsig = create_test_clsig(7, 9);
    let decoded = ChainLockSig::rlp_decode(&clsig.rlp_encode()).unwrap();
    assert_eq!(clsig.hash(), decoded.hash());
}

#[test]
fn test_equality_requires_all_fields() {
    let a = create_test_clsig(5, 1);
    let mut b = a.clone();
    assert_eq!(a, b);

    b.signature = BlsSignature::new([2u8; BLS_SIGNATURE_SIZE]);
    assert_ne!(a, b);
}

#[test]
fn test_decode_garbage_fails() {
    assert!(ChainLockSig::rlp_decode(b"").is_err());
    assert!(ChainLockSig::rlp_decode(&[0xc0]).is_err());
    assert!(ChainLockSig::rlp_decode(&[0xff; 64]).is_err());
}

#[test]
fn test_request_ids_distinct_per_height() {
    let ids: Vec<H256> = (0..100).map(chain_lock_request_id).collect();
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
}
