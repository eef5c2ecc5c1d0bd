// tests/common/mod.rs
//
// Shared fakes for the integration tests: in-memory store, scripted backend,
// recording speaker.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use virtual_soundbox::config::AppConfig;
use virtual_soundbox::error::RemoteError;
use virtual_soundbox::remote::{
    AccountApi, LedgerApi, LedgerEntry, ProfilePayload, RuleSource, ServerEntitlement,
    UpgradeRequest, UpgradeResponse,
};
use virtual_soundbox::rules::Rule;
use virtual_soundbox::store::session::{Identity, Session};
use virtual_soundbox::store::Store;
use virtual_soundbox::{App, Collaborators, EntitlementState, Speaker};

pub fn dana_rule() -> Rule {
    Rule {
        id: 1,
        source_matcher: "dana".into(),
        display_name: "DANA".into(),
        pattern: r"Rp\s?([\d.]+)".into(),
        speech_template: "Diterima {amount} rupiah dari {app_name}".into(),
        active: true,
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub rules: Mutex<Vec<Rule>>,
    pub rule_calls: Mutex<usize>,
    pub rules_down: Mutex<bool>,
    pub pushed: Mutex<Vec<LedgerEntry>>,
    pub history: Mutex<Vec<LedgerEntry>>,
    pub upgrade: Mutex<Option<UpgradeResponse>>,
    pub profile: Mutex<Option<ServerEntitlement>>,
    pub profiles: Mutex<Vec<ProfilePayload>>,
}

#[async_trait]
impl RuleSource for FakeBackend {
    async fn fetch_rules(&self) -> Result<Vec<Rule>, RemoteError> {
        *self.rule_calls.lock().unwrap() += 1;
        if *self.rules_down.lock().unwrap() {
            return Err(RemoteError::Status {
                endpoint: "config/rules",
                status: 503,
            });
        }
        Ok(self.rules.lock().unwrap().clone())
    }
}

#[async_trait]
impl LedgerApi for FakeBackend {
    async fn push(&self, _token: &str, batch: &[LedgerEntry]) -> Result<(), RemoteError> {
        self.pushed.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    async fn pull(&self, _: &str, _: &str, _: i64, _: i64) -> Result<Vec<LedgerEntry>, RemoteError> {
        Ok(self.history.lock().unwrap().clone())
    }
}

#[async_trait]
impl AccountApi for FakeBackend {
    async fn upgrade(&self, _: &str, _: &UpgradeRequest) -> Result<UpgradeResponse, RemoteError> {
        self.upgrade
            .lock()
            .unwrap()
            .clone()
            .ok_or(RemoteError::Status {
                endpoint: "subscription/upgrade",
                status: 500,
            })
    }

    async fn profile(&self, _: &str, _: &str) -> Result<ServerEntitlement, RemoteError> {
        self.profile
            .lock()
            .unwrap()
            .ok_or(RemoteError::Status {
                endpoint: "profile",
                status: 404,
            })
    }

    async fn sync_profile(&self, _: &str, profile: &ProfilePayload) -> Result<(), RemoteError> {
        self.profiles.lock().unwrap().push(profile.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSpeaker {
    pub spoken: Mutex<Vec<String>>,
}

impl Speaker for RecordingSpeaker {
    fn speak(&self, text: &str) {
        self.spoken.lock().unwrap().push(text.to_string());
    }
}

pub struct Harness {
    pub app: App,
    pub backend: Arc<FakeBackend>,
    pub speaker: Arc<RecordingSpeaker>,
}

/// App over an in-memory store with `rules` already installed and the given
/// starting entitlement.
pub fn harness(rules: Vec<Rule>, start: EntitlementState) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    Session::new(store.clone()).save_entitlement(&start).unwrap();

    let backend = Arc::new(FakeBackend::default());
    let speaker = Arc::new(RecordingSpeaker::default());
    let app = App::assemble(
        store,
        AppConfig::default(),
        Collaborators {
            rules: backend.clone(),
            ledger: Some(backend.clone() as Arc<dyn LedgerApi>),
            account: Some(backend.clone() as Arc<dyn AccountApi>),
            speaker: speaker.clone(),
        },
    )
    .unwrap();
    app.rules.replace_if_changed(rules).unwrap();
    Harness {
        app,
        backend,
        speaker,
    }
}

pub fn trial(n: u32) -> EntitlementState {
    EntitlementState {
        is_premium: false,
        remaining_trial: n,
        premium_expires_at: None,
    }
}

pub fn identity() -> Identity {
    Identity {
        token: "tok".into(),
        uid: "merchant-1".into(),
        email: "toko@example.com".into(),
        store_name: "Toko Makmur".into(),
    }
}
