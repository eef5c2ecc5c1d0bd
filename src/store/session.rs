// src/store/session.rs
//! Typed view over the `session` key/value table.
//!
//! Holds the signed-in identity, the entitlement counters and the cached
//! rule-set JSON with its fingerprint. Entitlement writes go through
//! [`Session::set_many`] so the three counters always land together.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::entitlement::EntitlementState;
use crate::error::StoreError;

pub const KEY_TOKEN: &str = "auth_token";
pub const KEY_UID: &str = "user_uid";
pub const KEY_EMAIL: &str = "user_email";
pub const KEY_STORE_NAME: &str = "store_name";
pub const KEY_IS_PREMIUM: &str = "is_premium";
pub const KEY_REMAINING_TRIAL: &str = "remaining_trial";
pub const KEY_EXPIRES_AT: &str = "premium_expires_at";
pub const KEY_RULES: &str = "notif_rules";
pub const KEY_RULES_FINGERPRINT: &str = "notif_rules_fingerprint";

/// Identity handed over by the external sign-in collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub token: String,
    pub uid: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub store_name: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    store: Arc<Store>,
}

impl Session {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.store.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM session WHERE key = ?1",
                params![key],
                |r| r.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_many(&[(key, value.to_string())])
    }

    /// Write several keys in one SQLite transaction.
    pub fn set_many(&self, pairs: &[(&str, String)]) -> Result<(), StoreError> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        for (k, v) in pairs {
            tx.execute(
                "INSERT INTO session (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![k, v],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // --- identity ---

    pub fn save_identity(&self, id: &Identity) -> Result<(), StoreError> {
        self.set_many(&[
            (KEY_TOKEN, id.token.clone()),
            (KEY_UID, id.uid.clone()),
            (KEY_EMAIL, id.email.clone()),
            (KEY_STORE_NAME, id.store_name.clone()),
        ])
    }

    pub fn identity(&self) -> Result<Option<Identity>, StoreError> {
        let (Some(token), Some(uid)) = (self.get(KEY_TOKEN)?, self.get(KEY_UID)?) else {
            return Ok(None);
        };
        Ok(Some(Identity {
            token,
            uid,
            email: self.get(KEY_EMAIL)?.unwrap_or_default(),
            store_name: self.get(KEY_STORE_NAME)?.unwrap_or_default(),
        }))
    }

    pub fn is_logged_in(&self) -> Result<bool, StoreError> {
        Ok(self.identity()?.is_some())
    }

    /// Forget everything: identity, entitlement counters and cached rules.
    pub fn logout(&self) -> Result<(), StoreError> {
        let conn = self.store.conn()?;
        conn.execute("DELETE FROM session", [])?;
        Ok(())
    }

    // --- entitlement ---

    pub fn load_entitlement(&self) -> Result<EntitlementState, StoreError> {
        let is_premium = self
            .get(KEY_IS_PREMIUM)?
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let remaining_trial = self
            .get(KEY_REMAINING_TRIAL)?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let premium_expires_at = self
            .get(KEY_EXPIRES_AT)?
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        Ok(EntitlementState {
            is_premium,
            remaining_trial,
            premium_expires_at,
        })
    }

    pub fn save_entitlement(&self, state: &EntitlementState) -> Result<(), StoreError> {
        let expires_ms = state
            .premium_expires_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        self.set_many(&[
            (KEY_IS_PREMIUM, state.is_premium.to_string()),
            (KEY_REMAINING_TRIAL, state.remaining_trial.to_string()),
            (KEY_EXPIRES_AT, expires_ms.to_string()),
        ])
    }

    // --- rule cache ---

    /// Cached rule-set JSON and its fingerprint, if both are present.
    pub fn cached_rules(&self) -> Result<Option<(String, String)>, StoreError> {
        match (self.get(KEY_RULES)?, self.get(KEY_RULES_FINGERPRINT)?) {
            (Some(json), Some(fp)) => Ok(Some((json, fp))),
            _ => Ok(None),
        }
    }

    pub fn save_rules(&self, json: &str, fingerprint: &str) -> Result<(), StoreError> {
        self.set_many(&[
            (KEY_RULES, json.to_string()),
            (KEY_RULES_FINGERPRINT, fingerprint.to_string()),
        ])
    }
}
