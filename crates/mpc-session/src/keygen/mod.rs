//! Distributed Key Generation
//!
//! Produces an ECDSA and an EdDSA keyshare for every committee member in one
//! relay session. The ECDSA run uses the default tag, the EdDSA run the
//! `eddsa` tag, so the two never share a setup payload or a mailbox.

mod dkg;

pub use dkg::run_keygen;
