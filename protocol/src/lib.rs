// Copyright (c) 2026 SQRL Auth Contributors. MIT License.
// See LICENSE for details.

//! # SQRL Protocol — Server Engine
//!
//! A server-side implementation of SQRL (Secure Quick Reliable Login):
//! passwordless, phishing-resistant authentication where the client proves
//! control of an Ed25519 key instead of disclosing a shared secret. The
//! server never stores anything a breach could replay — public keys only.
//!
//! ## Architecture
//!
//! The crate is split along the protocol's actual seams:
//!
//! - **engine** — The exchange handler: one POST in, one signed-state pack
//!   out. Start here.
//! - **nut** — Single-use nonces ("nuts") and the chains they form across
//!   a login session.
//! - **identity** — Identity and account entities plus their state machine
//!   (enabled, disabled, superseded).
//! - **urls** — Login URL bundles for browsers and redemption of
//!   out-of-band login codes.
//! - **pack** — The CRLF `key=value` wire codec and its base64url wrapping.
//! - **crypto** — Ed25519 verification and HMAC-SHA256 body binding.
//! - **store** — Persistence trait plus the in-memory reference store.
//! - **config** — Protocol constants and deployment configuration.
//!
//! ## Design Philosophy
//!
//! 1. The engine never panics on client input — hostile bytes get a `tif`
//!    flag, not a stack trace.
//! 2. All protocol state lives behind [`store::SqrlStore`]; the engine
//!    itself is shareable and stateless.
//! 3. Exactly one concurrency-sensitive operation exists (the nut claim),
//!    and it is the store's problem, stated in its contract.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod identity;
pub mod nut;
pub mod pack;
pub mod store;
pub mod urls;

pub use config::SqrlConfig;
pub use engine::SqrlHandler;
pub use store::{memory::MemoryStore, SqrlStore};
pub use urls::UrlBuilder;
