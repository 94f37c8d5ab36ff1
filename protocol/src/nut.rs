//! # Nut (Nonce) Lifecycle
//!
//! A "nut" is SQRL's single-use session nonce. Every protocol exchange
//! consumes exactly one and mints exactly one, so a login session is a
//! *chain* of nuts: the initial nut (minted into the QR code / login URL)
//! followed by one follow-up per round-trip. Follow-ups always point at the
//! chain's root via `initial`, never at each other — chains don't fork.
//!
//! Three properties carry the protocol's replay protection:
//!
//! 1. **Single-use**: claiming a nut (`use_nut`) is an atomic
//!    check-and-set against the store. Two concurrent requests presenting
//!    the same nut cannot both win.
//! 2. **HMAC chaining**: a follow-up nut stores an HMAC of the response
//!    body it was minted with; the next request must echo that exact body.
//! 3. **Timeout**: nuts expire a fixed interval after creation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{SqrlConfig, NUT_ID_BYTES};
use crate::crypto::sign_hmac;
use crate::pack::to_base64url;
use crate::store::{NewNut, SqrlStore, StoreError};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One single-use nonce, as persisted by the store.
///
/// All timestamps are set-once: the store writes `created`; the engine sets
/// `used` (atomically), `identified`, and `issued` exactly once each, and
/// never clears them.
#[derive(Debug, Clone, PartialEq)]
pub struct Nut {
    /// Opaque unguessable token (16 CSPRNG bytes, base64url).
    pub id: String,
    /// Root nut of this chain; `None` when this nut *is* the root.
    pub initial: Option<String>,
    /// Remote address the nut was minted for.
    pub ip: IpAddr,
    /// HMAC of the response body this nut was issued with. `None` on
    /// initial nuts (there is no prior response to bind).
    pub hmac: Option<String>,
    /// Account this chain has resolved to, claimed exactly once.
    pub user_id: Option<Uuid>,
    /// When the nut was minted.
    pub created: DateTime<Utc>,
    /// When the nut was presented and claimed by a request.
    pub used: Option<DateTime<Utc>>,
    /// When the nut's out-of-band code was redeemed for a session.
    pub issued: Option<DateTime<Utc>>,
    /// When a command successfully authenticated against this chain.
    pub identified: Option<DateTime<Utc>>,
}

impl Nut {
    /// Whether this nut is the root of its chain.
    pub fn is_initial(&self) -> bool {
        self.initial.is_none()
    }

    /// The id of this nut's chain root (its own id for initial nuts).
    pub fn root_id(&self) -> &str {
        self.initial.as_deref().unwrap_or(&self.id)
    }
}

/// Why a presented nut was refused.
///
/// The engine collapses every variant to the same wire-level transient
/// error (`tif 0x20`) but logs the distinction — "clients replaying nuts"
/// and "clocks disagreeing about timeouts" are very different operational
/// problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NutValidity {
    #[error("nut not found")]
    NotFound,
    #[error("nut already used")]
    Replayed,
    #[error("server echo does not match issued hmac")]
    HmacMismatch,
    #[error("nut expired")]
    Expired,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Mints, validates, and claims nuts against the store.
#[derive(Clone)]
pub struct NutManager {
    store: Arc<dyn SqrlStore>,
    hmac_secret: String,
    timeout: Duration,
}

impl NutManager {
    pub fn new(store: Arc<dyn SqrlStore>, config: &SqrlConfig) -> Self {
        Self {
            store,
            hmac_secret: config.hmac_secret.clone(),
            timeout: config.nut_timeout,
        }
    }

    /// Generate a fresh nut id: 128 bits from the OS CSPRNG, base64url.
    fn mint_id() -> String {
        let mut bytes = [0u8; NUT_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        to_base64url(bytes)
    }

    /// Mint the root nut of a new chain, bound to the caller's address.
    pub async fn create_initial(&self, ip: IpAddr) -> Result<Nut, StoreError> {
        self.create_initial_for_user(ip, None).await
    }

    /// Mint a root nut pre-bound to a known account (used when an already
    /// logged-in browser requests fresh login URLs).
    pub async fn create_initial_for_user(
        &self,
        ip: IpAddr,
        user_id: Option<Uuid>,
    ) -> Result<Nut, StoreError> {
        let nut = self
            .store
            .create_nut(NewNut {
                id: Self::mint_id(),
                ip,
                initial: None,
                user_id,
                hmac: None,
            })
            .await?;
        tracing::debug!(nut = %nut.id, %ip, "minted initial nut");
        Ok(nut)
    }

    /// Mint the next nut in an existing chain.
    ///
    /// The new nut points at the chain's *root* (`existing.initial` when the
    /// presented nut is itself a follow-up) and inherits the chain's address
    /// and resolved account.
    pub async fn create_follow_up(&self, existing: &Nut) -> Result<Nut, StoreError> {
        let nut = self
            .store
            .create_nut(NewNut {
                id: Self::mint_id(),
                ip: existing.ip,
                initial: Some(existing.root_id().to_string()),
                user_id: existing.user_id,
                hmac: None,
            })
            .await?;
        tracing::debug!(nut = %nut.id, root = %nut.root_id(), "minted follow-up nut");
        Ok(nut)
    }

    /// Atomically claim a nut for the current request.
    ///
    /// Delegates to the store's conditional update (`used` set iff currently
    /// unset). Returns `None` when the nut is missing or already claimed —
    /// including when a concurrent request won the race after this request
    /// validated the same nut.
    pub async fn use_nut(&self, id: &str) -> Result<Option<Nut>, StoreError> {
        self.store.use_nut(id).await
    }

    /// Check a retrieved nut against the presented request, in order:
    /// already used, HMAC mismatch (follow-ups only), expired.
    ///
    /// `server_raw` is the request's raw `server` field; for follow-up nuts
    /// it must HMAC to exactly what we recorded when the nut was issued.
    pub fn validate(&self, nut: &Nut, server_raw: &str) -> Result<(), NutValidity> {
        if nut.used.is_some() {
            return Err(NutValidity::Replayed);
        }

        if !nut.is_initial() {
            let expected = sign_hmac(server_raw, &self.hmac_secret);
            if nut.hmac.as_deref() != Some(expected.as_str()) {
                return Err(NutValidity::HmacMismatch);
            }
        }

        let age = Utc::now().signed_duration_since(nut.created);
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        if age > timeout {
            return Err(NutValidity::Expired);
        }

        Ok(())
    }

    /// HMAC a response body under this deployment's secret.
    pub fn sign_body(&self, body: &str) -> String {
        sign_hmac(body, &self.hmac_secret)
    }
}
