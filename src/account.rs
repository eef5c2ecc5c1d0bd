// src/account.rs
//! Entitlement-changing account flows: purchase acknowledgement, server
//! confirmation of an upgrade, and profile reconciliation.
//!
//! Locked history is released exactly on the transition into premium, so a
//! purchase that is first bridged locally and later confirmed unlocks once.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entitlement::{Entitlement, EntitlementState};
use crate::error::{AccountError, StoreError};
use crate::ledger::TransactionRepository;
use crate::remote::{AccountApi, ProfilePayload, UpgradeRequest};
use crate::store::profile::UserProfile;
use crate::store::session::{Identity, Session};

pub struct AccountService {
    session: Session,
    entitlement: Arc<Entitlement>,
    ledger: TransactionRepository,
    api: Option<Arc<dyn AccountApi>>,
    bridge: chrono::Duration,
}

/// Purchase details forwarded by the checkout collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct Purchase {
    #[serde(default = "default_plan")]
    pub plan_type: String,
    #[serde(default)]
    pub purchase_token: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

fn default_plan() -> String {
    "monthly".into()
}

impl AccountService {
    pub fn new(
        session: Session,
        entitlement: Arc<Entitlement>,
        ledger: TransactionRepository,
        api: Option<Arc<dyn AccountApi>>,
        bridge: chrono::Duration,
    ) -> Self {
        Self {
            session,
            entitlement,
            ledger,
            api,
            bridge,
        }
    }

    pub fn entitlement(&self) -> &Arc<Entitlement> {
        &self.entitlement
    }

    fn signed_in(&self) -> Result<(Identity, Arc<dyn AccountApi>), AccountError> {
        let identity = self.session.identity()?.ok_or(AccountError::NotSignedIn)?;
        let api = self.api.clone().ok_or(AccountError::NotSignedIn)?;
        Ok((identity, api))
    }

    fn unlock_if_upgraded(&self, before: &EntitlementState, after: &EntitlementState) -> Result<(), StoreError> {
        if !before.is_premium && after.is_premium {
            self.ledger.unlock_all()?;
        }
        Ok(())
    }

    /// Store the identity handed over by sign-in and open a local profile
    /// row for it. The row counts as unsynced until `profile/sync` accepts it.
    pub fn sign_in(&self, identity: &Identity) -> Result<(), StoreError> {
        self.session.save_identity(identity)?;
        self.session.store().upsert_profile(&UserProfile {
            uid: identity.uid.clone(),
            email: identity.email.clone(),
            store_name: identity.store_name.clone(),
            phone_number: String::new(),
            category: String::new(),
            joined_at: Utc::now(),
            is_synced: false,
        })?;
        tracing::info!(target: "entitlement", uid = %identity.uid, "signed in");
        Ok(())
    }

    /// Profile of the signed-in user, if any.
    pub fn profile(&self) -> Result<Option<UserProfile>, StoreError> {
        match self.session.identity()? {
            Some(id) => self.session.store().profile(&id.uid),
            None => Ok(None),
        }
    }

    /// Clear the session and the in-memory counters.
    pub fn sign_out(&self) -> Result<(), StoreError> {
        self.session.logout()?;
        self.entitlement.reset();
        tracing::info!(target: "entitlement", "signed out");
        Ok(())
    }

    /// Local optimistic premium right after checkout succeeds, then release
    /// locked history.
    pub fn acknowledge_purchase(&self, now: DateTime<Utc>) -> Result<EntitlementState, StoreError> {
        let before = self.entitlement.current(now)?;
        let after = self.entitlement.grant_bridge(now, self.bridge)?;
        self.unlock_if_upgraded(&before, &after)?;
        Ok(after)
    }

    /// Ask the server to activate the plan. On success its expiry replaces
    /// any local estimate; failure is returned to the caller.
    pub async fn confirm_upgrade(&self, purchase: &Purchase) -> Result<EntitlementState, AccountError> {
        let (identity, api) = self.signed_in()?;
        let req = UpgradeRequest {
            user_id: identity.uid.clone(),
            plan_type: purchase.plan_type.clone(),
            purchase_token: purchase.purchase_token.clone(),
            order_id: purchase.order_id.clone(),
        };
        let resp = api.upgrade(&identity.token, &req).await?;
        if !resp.is_success() {
            tracing::warn!(target: "entitlement", status = %resp.status, "upgrade rejected");
            return Err(AccountError::Rejected(resp.status));
        }
        let before = self.entitlement.current(Utc::now())?;
        let expires = resp.expiry_date.as_ref().and_then(|e| e.to_datetime());
        let after = self.entitlement.confirm_premium(expires)?;
        self.unlock_if_upgraded(&before, &after)?;
        Ok(after)
    }

    /// Acknowledge locally, then confirm with the server. When confirmation
    /// fails the bridge stays in place and the error is returned.
    pub async fn purchase(
        &self,
        now: DateTime<Utc>,
        purchase: &Purchase,
    ) -> Result<EntitlementState, AccountError> {
        self.acknowledge_purchase(now)?;
        self.confirm_upgrade(purchase).await
    }

    /// Upload the signed-in user's profile if the backend has not accepted
    /// the latest copy. The row is marked synced only after a 2xx; upload
    /// failures are logged and retried on the next call.
    pub async fn push_profile(&self) -> Result<bool, AccountError> {
        let (identity, api) = self.signed_in()?;
        let store = self.session.store();
        let Some(profile) = store
            .unsynced_profiles()?
            .into_iter()
            .find(|p| p.uid == identity.uid)
        else {
            return Ok(false);
        };
        match api
            .sync_profile(&identity.token, &ProfilePayload::from(&profile))
            .await
        {
            Ok(()) => {
                store.mark_profile_synced(&profile.uid)?;
                tracing::debug!(target: "entitlement", uid = %profile.uid, "profile uploaded");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(target: "entitlement", uid = %profile.uid, error = %e, "profile upload failed");
                Ok(false)
            }
        }
    }

    /// Upload a pending profile, then pull the server entitlement and adopt
    /// it as authoritative.
    pub async fn reconcile_profile(&self) -> Result<EntitlementState, AccountError> {
        self.push_profile().await?;
        let (identity, api) = self.signed_in()?;
        let server = api.profile(&identity.token, &identity.uid).await?;
        let now = Utc::now();
        let before = self.entitlement.current(now)?;
        self.entitlement.apply_server(&server)?;
        let after = self.entitlement.current(now)?;
        self.unlock_if_upgraded(&before, &after)?;
        Ok(after)
    }
}
