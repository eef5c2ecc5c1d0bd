// src/remote/mod.rs
//! Backend API surface as seen by the core: wire DTOs plus one small trait per
//! collaborator so tests can swap in fakes. `http::BackendClient` implements
//! all three against the real service.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::extract::ExtractedTransaction;
use crate::rules::Rule;
use crate::store::profile::UserProfile;

#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, RemoteError>;
}

#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn push(&self, token: &str, batch: &[LedgerEntry]) -> Result<(), RemoteError>;
    async fn pull(
        &self,
        token: &str,
        uid: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LedgerEntry>, RemoteError>;
}

#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn upgrade(&self, token: &str, req: &UpgradeRequest) -> Result<UpgradeResponse, RemoteError>;
    async fn profile(&self, token: &str, uid: &str) -> Result<ServerEntitlement, RemoteError>;
    /// `POST profile/sync`. Ok only on a 2xx.
    async fn sync_profile(&self, token: &str, profile: &ProfilePayload) -> Result<(), RemoteError>;
}

/// One row of the remote ledger (`POST transactions/sync`, `GET transactions`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: String,
    pub source_app: String,
    pub amount: f64,
    pub raw_message: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub is_trial_limited: bool,
}

impl LedgerEntry {
    pub fn from_transaction(user_id: &str, tx: &ExtractedTransaction) -> Self {
        Self {
            user_id: user_id.to_string(),
            source_app: tx.source_app.clone(),
            amount: tx.amount,
            raw_message: tx.raw_message.clone(),
            timestamp: tx.timestamp.timestamp_millis(),
            is_trial_limited: tx.is_trial_limited,
        }
    }

    pub fn into_transaction(self) -> ExtractedTransaction {
        ExtractedTransaction {
            source_app: self.source_app,
            amount: self.amount,
            raw_message: self.raw_message,
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
            is_trial_limited: self.is_trial_limited,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub user_id: String,
    pub plan_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeResponse {
    pub status: String,
    #[serde(default)]
    pub expiry_date: Option<ExpiryDate>,
}

impl UpgradeResponse {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "success" | "ok" | "active" | "premium"
        )
    }
}

/// Expiry as sent by the backend: epoch millis, or a date string
/// (RFC 3339 or `YYYY-MM-DD HH:MM:SS` in UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiryDate {
    Millis(i64),
    Text(String),
}

impl ExpiryDate {
    /// `None` for zero/unparsable values, which the core treats as "no expiry known".
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ExpiryDate::Millis(ms) if *ms > 0 => DateTime::from_timestamp_millis(*ms),
            ExpiryDate::Millis(_) => None,
            ExpiryDate::Text(s) => {
                let s = s.trim();
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Some(dt.with_timezone(&Utc));
                }
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|n| n.and_utc())
            }
        }
    }
}

/// Merchant profile as uploaded to `profile/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePayload {
    pub uid: String,
    pub email: String,
    pub store_name: String,
    pub phone_number: String,
    pub category: String,
    /// Epoch milliseconds.
    pub joined_at: i64,
}

impl From<&UserProfile> for ProfilePayload {
    fn from(p: &UserProfile) -> Self {
        Self {
            uid: p.uid.clone(),
            email: p.email.clone(),
            store_name: p.store_name.clone(),
            phone_number: p.phone_number.clone(),
            category: p.category.clone(),
            joined_at: p.joined_at.timestamp_millis(),
        }
    }
}

/// Authoritative entitlement as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntitlement {
    pub is_premium: bool,
    pub remaining_trial: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `is_premium` is required: a 2xx error body must not pass for a
/// free-tier entitlement.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubscriptionDto {
    is_premium: bool,
    #[serde(default)]
    remaining_trial: i64,
    #[serde(default)]
    expiry_date: Option<ExpiryDate>,
}

/// `GET profile/{uid}` has been seen both flat and with the counters nested
/// under `subscription`; accept either.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProfileAny {
    Wrapped { subscription: SubscriptionDto },
    Flat(SubscriptionDto),
}

impl From<ProfileAny> for ServerEntitlement {
    fn from(any: ProfileAny) -> Self {
        let dto = match any {
            ProfileAny::Wrapped { subscription } => subscription,
            ProfileAny::Flat(dto) => dto,
        };
        ServerEntitlement {
            is_premium: dto.is_premium,
            remaining_trial: u32::try_from(dto.remaining_trial.max(0)).unwrap_or(u32::MAX),
            expires_at: dto.expiry_date.as_ref().and_then(ExpiryDate::to_datetime),
        }
    }
}
