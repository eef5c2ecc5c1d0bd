// src/remote/http.rs
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::{
    AccountApi, LedgerApi, LedgerEntry, ProfileAny, ProfilePayload, RuleSource,
    ServerEntitlement, UpgradeRequest, UpgradeResponse,
};
use crate::config::BackendConfig;
use crate::error::RemoteError;
use crate::rules::Rule;

const EP_RULES: &str = "config/rules";
const EP_TX_SYNC: &str = "transactions/sync";
const EP_TX_LIST: &str = "transactions";
const EP_UPGRADE: &str = "subscription/upgrade";
const EP_PROFILE: &str = "profile";
const EP_PROFILE_SYNC: &str = "profile/sync";

/// reqwest-backed client for the soundbox backend.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base: String,
}

impl BackendClient {
    pub fn new(cfg: &BackendConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .user_agent(concat!("virtual-soundbox/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        let mut base = cfg.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn ensure_success(endpoint: &'static str, resp: &reqwest::Response) -> Result<(), RemoteError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(RemoteError::Status {
            endpoint,
            status: status.as_u16(),
        });
    }
    Ok(())
}

async fn decode<T: DeserializeOwned>(
    endpoint: &'static str,
    resp: reqwest::Response,
) -> Result<T, RemoteError> {
    ensure_success(endpoint, &resp)?;
    let body = resp.text().await?;
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Err(RemoteError::Decode {
            endpoint,
            reason: "empty body".into(),
        });
    }
    serde_json::from_str(trimmed).map_err(|e| RemoteError::Decode {
        endpoint,
        reason: e.to_string(),
    })
}

#[async_trait]
impl RuleSource for BackendClient {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, RemoteError> {
        let resp = self.http.get(self.url(EP_RULES)).send().await?;
        decode(EP_RULES, resp).await
    }
}

#[async_trait]
impl LedgerApi for BackendClient {
    async fn push(&self, token: &str, batch: &[LedgerEntry]) -> Result<(), RemoteError> {
        let resp = self
            .http
            .post(self.url(EP_TX_SYNC))
            .bearer_auth(token)
            .json(batch)
            .send()
            .await?;
        ensure_success(EP_TX_SYNC, &resp)
    }

    async fn pull(
        &self,
        token: &str,
        uid: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LedgerEntry>, RemoteError> {
        let resp = self
            .http
            .get(self.url(EP_TX_LIST))
            .bearer_auth(token)
            .query(&[
                ("user_id", uid.to_string()),
                ("start", start_ms.to_string()),
                ("end", end_ms.to_string()),
            ])
            .send()
            .await?;
        // The backend answers `null` for an empty history.
        match decode::<Vec<LedgerEntry>>(EP_TX_LIST, resp).await {
            Ok(rows) => Ok(rows),
            Err(RemoteError::Decode { reason, .. }) if reason == "empty body" => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AccountApi for BackendClient {
    async fn upgrade(&self, token: &str, req: &UpgradeRequest) -> Result<UpgradeResponse, RemoteError> {
        let resp = self
            .http
            .post(self.url(EP_UPGRADE))
            .bearer_auth(token)
            .json(req)
            .send()
            .await?;
        decode(EP_UPGRADE, resp).await
    }

    async fn profile(&self, token: &str, uid: &str) -> Result<ServerEntitlement, RemoteError> {
        let resp = self
            .http
            .get(self.url(&format!("{EP_PROFILE}/{uid}")))
            .bearer_auth(token)
            .send()
            .await?;
        let any: ProfileAny = decode(EP_PROFILE, resp).await?;
        Ok(any.into())
    }

    async fn sync_profile(&self, token: &str, profile: &ProfilePayload) -> Result<(), RemoteError> {
        let resp = self
            .http
            .post(self.url(EP_PROFILE_SYNC))
            .bearer_auth(token)
            .json(profile)
            .send()
            .await?;
        ensure_success(EP_PROFILE_SYNC, &resp)
    }
}
