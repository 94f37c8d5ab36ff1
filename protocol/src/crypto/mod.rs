//! # Cryptographic Primitives for SQRL
//!
//! Two primitives carry the whole protocol:
//!
//! - **Ed25519** detached signatures — every client request is authenticated
//!   against the identity key it claims to be from.
//! - **HMAC-SHA256** — binds each follow-up nonce to the exact response body
//!   it was minted for, so a client cannot replay stale server state.
//!
//! ## A note on "rolling your own crypto"
//!
//! We don't. Everything here is a thin wrapper around audited
//! implementations. The value these modules add is policy: lenient base64
//! at the edge, strict verification inside, and failure that collapses to
//! `false` instead of leaking error oracles to the network.

pub mod hmac;
pub mod signature;

pub use hmac::sign_hmac;
pub use signature::verify_signature;
