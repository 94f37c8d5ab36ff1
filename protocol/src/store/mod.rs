//! # Storage Abstraction
//!
//! The engine holds no mutable state of its own — every nut, identity, and
//! account lives behind [`SqrlStore`]. The trait is deliberately shaped like
//! a transactional key-value service: short single-entity round-trips, no
//! cross-call locking, no caching of entity state between requests.
//!
//! Two contract points deserve emphasis because the protocol's correctness
//! hangs on them:
//!
//! - [`SqrlStore::use_nut`] must be an **atomic conditional update**
//!   (`used` set iff currently unset), not a read-then-write. This is the
//!   single concurrency-correctness requirement in the whole system.
//! - [`SqrlStore::retrieve_identities`] must return its results
//!   **positionally aligned** with the requested keys, with `None`
//!   placeholders for misses. The engine correlates `idk`/`pidk` strictly
//!   by position; silently dropping a miss would shift the previous key
//!   into the current key's slot.
//!
//! [`memory::MemoryStore`] is the reference implementation and the one the
//! test suite runs against. SQL adapters live outside this crate.

pub mod memory;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{Account, Identity};
use crate::nut::Nut;

/// Errors surfaced by a storage adapter.
///
/// The engine never lets these reach the wire — at its outermost boundary
/// they degrade to a generic failure pack — but they stay distinct
/// internally so failures are loggable and independently testable.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An entity targeted by an update does not exist.
    #[error("entity not found: {0}")]
    MissingEntity(&'static str),

    /// A uniqueness constraint was violated (e.g. duplicate idk).
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// The backing store failed (connection, query, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Parameters for minting a nut. The store stamps `created` itself.
#[derive(Debug, Clone)]
pub struct NewNut {
    pub id: String,
    pub ip: IpAddr,
    pub initial: Option<String>,
    pub user_id: Option<Uuid>,
    pub hmac: Option<String>,
}

/// Parameters for registering a SQRL identity.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub idk: String,
    pub suk: String,
    pub vuk: String,
    pub user_id: Uuid,
}

/// Persistence contract consumed by the protocol engine.
#[async_trait]
pub trait SqrlStore: Send + Sync {
    // -- Nuts ---------------------------------------------------------------

    /// Persist a freshly minted nut.
    async fn create_nut(&self, new: NewNut) -> Result<Nut, StoreError>;

    /// Fetch a nut by id.
    async fn retrieve_nut(&self, id: &str) -> Result<Option<Nut>, StoreError>;

    /// Atomically claim a nut: set `used` iff it is currently unset.
    ///
    /// Returns the claimed nut, or `None` when it is missing or was already
    /// claimed (equivalent of `UPDATE nuts SET used=now() WHERE id=$1 AND
    /// used IS NULL`).
    async fn use_nut(&self, id: &str) -> Result<Option<Nut>, StoreError>;

    /// Overwrite a nut's mutable fields (`hmac`, `user_id`, `identified`,
    /// `issued`). Returns `None` when the nut does not exist.
    async fn update_nut(&self, nut: &Nut) -> Result<Option<Nut>, StoreError>;

    /// Delete nuts older than `retention`, plus any whose out-of-band code
    /// has already been redeemed. Returns how many were removed.
    async fn sweep_nuts(&self, retention: Duration) -> Result<u64, StoreError>;

    // -- Identities ---------------------------------------------------------

    /// Register a new identity. Fails with [`StoreError::Conflict`] when the
    /// idk is already known.
    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError>;

    /// Batch-fetch identities by idk, **positionally aligned** with the
    /// input: `result[i]` is the identity for `idks[i]` or `None`.
    async fn retrieve_identities(
        &self,
        idks: &[&str],
    ) -> Result<Vec<Option<Identity>>, StoreError>;

    /// Overwrite an identity's mutable fields (`disabled`, `superseded`).
    async fn update_identity(&self, identity: &Identity) -> Result<Option<Identity>, StoreError>;

    /// Delete every identity bound to an account.
    async fn delete_identities_for_user(&self, user_id: Uuid) -> Result<u64, StoreError>;

    // -- Accounts -----------------------------------------------------------

    /// Create a new, empty account.
    async fn create_account(&self) -> Result<Account, StoreError>;

    /// Fetch an account by id.
    async fn retrieve_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;

    /// Delete an account. Returns the deleted account, `None` if unknown.
    async fn delete_account(&self, id: Uuid) -> Result<Option<Account>, StoreError>;
}
