//! # Admission
//!
//! Proof-of-work-gated membership. A peer asks in (or is invited in), is
//! handed a challenge bound to its pending request, solves it with its own
//! [`PowSolver`](crate::crypto::pow::PowSolver), and only then rises above
//! `pending`.
//!
//! ```text
//! controller.rs  AdmissionController: requests, invites, challenges, proofs
//! client.rs      AdmissionClient: the joining peer's HTTP side
//! wire.rs        JSON bodies of the service endpoints
//! error.rs       AdmissionError
//! ```

pub mod client;
pub mod controller;
pub mod error;
pub mod wire;

pub use client::AdmissionClient;
pub use controller::{AdmissionController, AdmissionDeps, ExpirySweep};
pub use error::AdmissionError;
pub use wire::{InviteReply, JoinReply, ProofReceipt, ProofSubmission};
