//! Committee resharing
//!
//! Moves both keys of a vault from the old signers to a new committee
//! without changing the public keys. Old signers that stay in the new
//! committee contribute their keyshares; new members join without one.

mod qc;

pub use qc::run_reshare;
