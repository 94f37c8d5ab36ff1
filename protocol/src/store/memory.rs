//! # In-Memory Reference Store
//!
//! The canonical [`SqrlStore`] implementation: three `DashMap`s and no I/O.
//! Production deployments put a database behind the trait instead; this one
//! exists so the engine is fully exercisable (and testable, and demoable)
//! without standing up infrastructure.
//!
//! ## Atomicity
//!
//! `use_nut` relies on `DashMap::get_mut`: the exclusive entry guard makes
//! the check-and-set on `used` atomic with respect to concurrent claims of
//! the same nut, which is exactly the `UPDATE ... WHERE used IS NULL`
//! contract the trait demands.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::identity::{Account, Identity};
use crate::nut::Nut;

use super::{NewIdentity, NewNut, SqrlStore, StoreError};

/// DashMap-backed store; cheap to construct, safe to share via `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nuts: DashMap<String, Nut>,
    identities: DashMap<String, Identity>,
    accounts: DashMap<Uuid, Account>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nuts. Test/diagnostic aid.
    pub fn nut_count(&self) -> usize {
        self.nuts.len()
    }

    /// Number of registered identities. Test/diagnostic aid.
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Number of accounts. Test/diagnostic aid.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }
}

#[async_trait]
impl SqrlStore for MemoryStore {
    // -- Nuts ---------------------------------------------------------------

    async fn create_nut(&self, new: NewNut) -> Result<Nut, StoreError> {
        let nut = Nut {
            id: new.id,
            initial: new.initial,
            ip: new.ip,
            hmac: new.hmac,
            user_id: new.user_id,
            created: Utc::now(),
            used: None,
            issued: None,
            identified: None,
        };
        if self.nuts.contains_key(&nut.id) {
            return Err(StoreError::Conflict("nut id"));
        }
        self.nuts.insert(nut.id.clone(), nut.clone());
        Ok(nut)
    }

    async fn retrieve_nut(&self, id: &str) -> Result<Option<Nut>, StoreError> {
        Ok(self.nuts.get(id).map(|entry| entry.clone()))
    }

    async fn use_nut(&self, id: &str) -> Result<Option<Nut>, StoreError> {
        // The get_mut guard is held across the check and the set, so two
        // concurrent claims serialize and only one observes `used == None`.
        match self.nuts.get_mut(id) {
            Some(mut entry) => {
                if entry.used.is_some() {
                    Ok(None)
                } else {
                    entry.used = Some(Utc::now());
                    Ok(Some(entry.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn update_nut(&self, nut: &Nut) -> Result<Option<Nut>, StoreError> {
        match self.nuts.get_mut(&nut.id) {
            Some(mut entry) => {
                *entry = nut.clone();
                Ok(Some(nut.clone()))
            }
            None => Ok(None),
        }
    }

    async fn sweep_nuts(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = self.nuts.len();
        self.nuts
            .retain(|_, nut| nut.created > cutoff && nut.issued.is_none());
        Ok((before - self.nuts.len()) as u64)
    }

    // -- Identities ---------------------------------------------------------

    async fn create_identity(&self, new: NewIdentity) -> Result<Identity, StoreError> {
        if self.identities.contains_key(&new.idk) {
            return Err(StoreError::Conflict("idk"));
        }
        let identity = Identity {
            idk: new.idk,
            suk: new.suk,
            vuk: new.vuk,
            user_id: new.user_id,
            created: Utc::now(),
            disabled: None,
            superseded: None,
        };
        self.identities
            .insert(identity.idk.clone(), identity.clone());
        Ok(identity)
    }

    async fn retrieve_identities(
        &self,
        idks: &[&str],
    ) -> Result<Vec<Option<Identity>>, StoreError> {
        Ok(idks
            .iter()
            .map(|idk| self.identities.get(*idk).map(|entry| entry.clone()))
            .collect())
    }

    async fn update_identity(&self, identity: &Identity) -> Result<Option<Identity>, StoreError> {
        match self.identities.get_mut(&identity.idk) {
            Some(mut entry) => {
                *entry = identity.clone();
                Ok(Some(identity.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_identities_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let before = self.identities.len();
        self.identities
            .retain(|_, identity| identity.user_id != user_id);
        Ok((before - self.identities.len()) as u64)
    }

    // -- Accounts -----------------------------------------------------------

    async fn create_account(&self) -> Result<Account, StoreError> {
        let account = Account {
            id: Uuid::new_v4(),
            created: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn retrieve_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(&id).map(|entry| entry.clone()))
    }

    async fn delete_account(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.remove(&id).map(|(_, account)| account))
    }
}
