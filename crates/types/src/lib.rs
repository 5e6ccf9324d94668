//! # Granite Types
//!
//! Core type definitions for the Granite blockchain.
//!
//! This crate provides the fundamental types shared across Granite:
//! - [`H256`] - 32-byte hashes with Keccak256 support
//! - [`ChainLockSig`] - threshold signature finalizing a (height, block) pair
//! - [`RecoveredSig`] - recovered threshold signature delivered by the
//!   quorum signing layer
//!
//! ## Example
//!
//! ```rust
//! use granite_types::{ChainLockSig, H256};
//!
//! // Hash some data
//! let block_hash = H256::keccak256(b"block");
//!
//! // A null chain lock carries the -1 height sentinel
//! let clsig = ChainLockSig::default();
//! assert!(clsig.is_null());
//! assert_ne!(block_hash, H256::NIL);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod chainlock;
pub mod hash;

// Re-export main types at crate root
pub use chainlock::{
    chain_lock_request_id, BlsSignature, ChainLockSig, QuorumType, RecoveredSig,
    BLS_SIGNATURE_SIZE, NULL_HEIGHT,
};
pub use hash::{keccak256, keccak256_concat, BlockHash, Txid, H256};

/// Result type alias for Granite types operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Granite types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid hash format
    #[error("invalid hash format: {0}")]
    InvalidHash(String),

    /// RLP decoding error
    #[error("RLP decode error: {0}")]
    RlpDecode(#[from] rlp::DecoderError),
}
