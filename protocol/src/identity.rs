//! # Identities & Accounts
//!
//! A SQRL identity binds one client public key (`idk`) to one account,
//! together with the unlock key material (`suk`/`vuk`) that authorizes
//! recovery-grade operations without the primary signing key.
//!
//! An identity moves through three states, strictly forward:
//!
//! ```text
//! enabled  <--->  disabled  ---->  superseded
//! ```
//!
//! Enable/disable toggle freely (with the right unlock signature).
//! Superseding is final: it happens when a client rotates to a new `idk`
//! under the same account, and a superseded identity can never authenticate
//! again — the engine only lets `query` touch it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{NewIdentity, SqrlStore, StoreError};

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One SQRL public-key identity bound to an account.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Identity key: base64url Ed25519 public key, the client's identity
    /// for this site.
    pub idk: String,
    /// Server unlock key, returned to the client when it needs to run the
    /// unlock protocol.
    pub suk: String,
    /// Verify unlock key: public key that unlock request signatures (`urs`)
    /// must verify against.
    pub vuk: String,
    /// Owning account.
    pub user_id: Uuid,
    pub created: DateTime<Utc>,
    /// Set while the identity is deactivated; cleared by `enable`.
    pub disabled: Option<DateTime<Utc>>,
    /// Set when the identity was rotated away. Never cleared.
    pub superseded: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.is_some()
    }
}

/// An account. The protocol core only needs existence and identity — any
/// application profile data hangs off `id` in tables this crate never sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub created: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Store adapter for identity operations.
///
/// Thin by intent: each method is one store round-trip plus the state rule
/// it enforces. Errors stay as [`StoreError`] — the engine decides what any
/// failure means for the wire.
#[derive(Clone)]
pub struct IdentityProvider {
    store: Arc<dyn SqrlStore>,
}

impl IdentityProvider {
    pub fn new(store: Arc<dyn SqrlStore>) -> Self {
        Self { store }
    }

    /// Batch-resolve identity keys, preserving input order.
    ///
    /// `result[i]` corresponds to `idks[i]`; a `None` key short-circuits to
    /// a `None` slot without hitting the store. The engine depends on this
    /// alignment to tell "current idk" from "previous idk".
    pub async fn find(
        &self,
        idks: &[Option<&str>],
    ) -> Result<Vec<Option<Identity>>, StoreError> {
        let present: Vec<&str> = idks.iter().flatten().copied().collect();
        let mut found = if present.is_empty() {
            Vec::new()
        } else {
            self.store.retrieve_identities(&present).await?
        }
        .into_iter();

        Ok(idks
            .iter()
            .map(|slot| slot.and_then(|_| found.next().flatten()))
            .collect())
    }

    /// Register a new identity for an account from the client-supplied key
    /// material.
    pub async fn create(
        &self,
        user_id: Uuid,
        idk: &str,
        suk: &str,
        vuk: &str,
    ) -> Result<Identity, StoreError> {
        tracing::info!(%user_id, idk, "creating sqrl identity");
        self.store
            .create_identity(NewIdentity {
                idk: idk.to_string(),
                suk: suk.to_string(),
                vuk: vuk.to_string(),
                user_id,
            })
            .await
    }

    /// Clear the disabled flag.
    pub async fn enable(&self, identity: &Identity) -> Result<Identity, StoreError> {
        tracing::info!(idk = %identity.idk, "enabling sqrl identity");
        let mut updated = identity.clone();
        updated.disabled = None;
        self.store
            .update_identity(&updated)
            .await?
            .ok_or(StoreError::MissingEntity("identity"))
    }

    /// Set the disabled flag. Idempotent: an already-disabled identity
    /// keeps its original `disabled` timestamp.
    pub async fn disable(&self, identity: &Identity) -> Result<Identity, StoreError> {
        tracing::info!(idk = %identity.idk, "disabling sqrl identity");
        let mut updated = identity.clone();
        updated.disabled = updated.disabled.or_else(|| Some(Utc::now()));
        self.store
            .update_identity(&updated)
            .await?
            .ok_or(StoreError::MissingEntity("identity"))
    }

    /// Permanently retire an identity in favor of a rotated key.
    ///
    /// Superseding implies disabling: both timestamps are set (the disabled
    /// one only if not already set). There is no inverse operation.
    pub async fn supersede(&self, identity: &Identity) -> Result<Identity, StoreError> {
        tracing::info!(idk = %identity.idk, "superseding sqrl identity");
        let now = Utc::now();
        let mut updated = identity.clone();
        updated.disabled = updated.disabled.or(Some(now));
        updated.superseded = Some(now);
        self.store
            .update_identity(&updated)
            .await?
            .ok_or(StoreError::MissingEntity("identity"))
    }

    /// Delete every identity belonging to the identity's account.
    pub async fn remove(&self, identity: &Identity) -> Result<u64, StoreError> {
        tracing::info!(idk = %identity.idk, user_id = %identity.user_id, "removing sqrl identities");
        self.store.delete_identities_for_user(identity.user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn provider_with_identity() -> (IdentityProvider, Identity) {
        let store = Arc::new(MemoryStore::new());
        let provider = IdentityProvider::new(Arc::clone(&store) as Arc<dyn SqrlStore>);
        let account = store.create_account().await.unwrap();
        let identity = provider
            .create(account.id, "IDK", "SUK", "VUK")
            .await
            .unwrap();
        (provider, identity)
    }

    #[tokio::test]
    async fn find_aligns_with_requested_slots() {
        let (provider, identity) = provider_with_identity().await;

        // pidk slot absent: result keeps two slots, second None.
        let found = provider.find(&[Some("IDK"), None]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].as_ref().unwrap().idk, identity.idk);
        assert!(found[1].is_none());

        // Unknown idk in first slot must not shift the known pidk left.
        let found = provider.find(&[Some("UNKNOWN"), Some("IDK")]).await.unwrap();
        assert!(found[0].is_none());
        assert_eq!(found[1].as_ref().unwrap().idk, identity.idk);
    }

    #[tokio::test]
    async fn find_with_no_keys_is_empty() {
        let (provider, _) = provider_with_identity().await;
        assert!(provider.find(&[]).await.unwrap().is_empty());
        let found = provider.find(&[None, None]).await.unwrap();
        assert!(found.iter().all(Option::is_none));
    }

    #[tokio::test]
    async fn disable_is_idempotent_on_timestamp() {
        let (provider, identity) = provider_with_identity().await;
        let disabled = provider.disable(&identity).await.unwrap();
        let first_ts = disabled.disabled.unwrap();

        let again = provider.disable(&disabled).await.unwrap();
        assert_eq!(again.disabled, Some(first_ts));
    }

    #[tokio::test]
    async fn enable_clears_disabled() {
        let (provider, identity) = provider_with_identity().await;
        let disabled = provider.disable(&identity).await.unwrap();
        let enabled = provider.enable(&disabled).await.unwrap();
        assert!(!enabled.is_disabled());
    }

    #[tokio::test]
    async fn supersede_couples_disable_and_is_permanent() {
        let (provider, identity) = provider_with_identity().await;
        let superseded = provider.supersede(&identity).await.unwrap();
        assert!(superseded.is_superseded());
        assert!(superseded.is_disabled());

        // An identity disabled earlier keeps its disabled timestamp.
        let (provider, identity) = provider_with_identity().await;
        let disabled = provider.disable(&identity).await.unwrap();
        let ts = disabled.disabled.unwrap();
        let superseded = provider.supersede(&disabled).await.unwrap();
        assert_eq!(superseded.disabled, Some(ts));
        assert!(superseded.superseded.unwrap() >= ts);
    }

    #[tokio::test]
    async fn remove_deletes_all_identities_for_account() {
        let store = Arc::new(MemoryStore::new());
        let provider = IdentityProvider::new(Arc::clone(&store) as Arc<dyn SqrlStore>);
        let account = store.create_account().await.unwrap();
        provider.create(account.id, "K1", "S", "V").await.unwrap();
        let second = provider.create(account.id, "K2", "S", "V").await.unwrap();

        assert_eq!(provider.remove(&second).await.unwrap(), 2);
        let found = provider.find(&[Some("K1"), Some("K2")]).await.unwrap();
        assert!(found.iter().all(Option::is_none));
    }
}
