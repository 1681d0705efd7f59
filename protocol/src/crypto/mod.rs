//! # Cryptographic Primitives
//!
//! ```text
//! keys.rs         Ed25519 identity keys, signatures, peer fingerprints
//! encryption.rs   AES-256-GCM sealing used by the in-memory KMS
//! kms.rs          Key management boundary and its in-memory backend
//! pow.rs          Proof-of-work solver boundary and the SHA-256 search
//! ```
//!
//! Nothing in here is novel. Ed25519 via ed25519-dalek, AES-GCM via the
//! RustCrypto crates, SHA-256 for the admission puzzle and BLAKE3 for
//! fingerprints and key derivation.

pub mod encryption;
pub mod keys;
pub mod kms;
pub mod pow;

pub use keys::{KeyError, NodeKeypair, PeerId, PublicKey, Signature};
pub use kms::{Kms, KmsError, MemoryKms};
pub use pow::{PowError, PowSolver, Sha256Solver};
