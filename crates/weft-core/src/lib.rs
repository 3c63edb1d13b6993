//! weft Core Library
//!
//! This crate provides the identity primitives for the weft overlay network:
//! public-key-derived peer addresses, proof-of-work gating identity issuance,
//! and identity file persistence.
//!
//! # Modules
//!
//! - [`identity`]: PeerAddress, ProofOfWork, Identity, NetworkId
//! - [`error`]: Error types

pub mod error;
pub mod identity;

pub use error::{Error, Result};
pub use identity::{Identity, NetworkId, PeerAddress, ProofOfWork};
