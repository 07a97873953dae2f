//! Head/node trust: keypair bootstrap, assertions, and node-side verification.

pub mod assertion;
pub mod keys;
pub mod node;

pub use assertion::{AssertionClaims, AssertionSigner, AssertionVerifier};
pub use node::NodeTrust;
