// src/app.rs
//! Wiring: builds every core component over one store and hands out the
//! shared handles used by the ingress and the background loops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::account::AccountService;
use crate::config::AppConfig;
use crate::entitlement::{spawn_expiry_watch, Entitlement};
use crate::error::StoreError;
use crate::extract::ExtractionEngine;
use crate::ledger::TransactionRepository;
use crate::pipeline::{LogSpeaker, Pipeline, Speaker};
use crate::remote::http::BackendClient;
use crate::remote::{AccountApi, LedgerApi, RuleSource};
use crate::rules::sync::{spawn_rule_sync, RuleSyncTrigger, RuleSynchronizer};
use crate::rules::RuleCache;
use crate::store::session::Session;
use crate::store::Store;

/// External systems the core talks to.
pub struct Collaborators {
    pub rules: Arc<dyn RuleSource>,
    pub ledger: Option<Arc<dyn LedgerApi>>,
    pub account: Option<Arc<dyn AccountApi>>,
    pub speaker: Arc<dyn Speaker>,
}

impl Collaborators {
    /// Everything backed by the real backend; speech goes to the log.
    pub fn backend(client: BackendClient) -> Self {
        let client = Arc::new(client);
        Self {
            rules: client.clone(),
            ledger: Some(client.clone() as Arc<dyn LedgerApi>),
            account: Some(client as Arc<dyn AccountApi>),
            speaker: Arc::new(LogSpeaker),
        }
    }
}

#[derive(Clone)]
pub struct App {
    pub session: Session,
    pub rules: Arc<RuleCache>,
    pub sync: Arc<RuleSynchronizer>,
    pub trigger: RuleSyncTrigger,
    pub entitlement: Arc<Entitlement>,
    pub ledger: TransactionRepository,
    pub account: Arc<AccountService>,
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<AppConfig>,
}

impl App {
    pub fn assemble(store: Arc<Store>, config: AppConfig, c: Collaborators) -> Result<Self, StoreError> {
        let session = Session::new(store);
        let rules = Arc::new(RuleCache::load(session.clone())?);
        let sync = Arc::new(RuleSynchronizer::new(c.rules, rules.clone()));
        let entitlement = Arc::new(Entitlement::load(session.clone())?);
        let ledger = TransactionRepository::new(session.clone(), c.ledger);
        let account = Arc::new(AccountService::new(
            session.clone(),
            entitlement.clone(),
            ledger.clone(),
            c.account,
            config.entitlement.bridge(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            ExtractionEngine::new(rules.clone()),
            entitlement.clone(),
            ledger.clone(),
            c.speaker,
        ));
        Ok(Self {
            session,
            rules,
            sync,
            trigger: RuleSyncTrigger::new(),
            entitlement,
            ledger,
            account,
            pipeline,
            config: Arc::new(config),
        })
    }

    /// Start-up pass: retention sweep of stale locked records.
    pub fn start(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.pipeline
            .start(now, self.config.retention.locked_max_age())
    }

    /// Rule sync loop and expiry watch. Abort the handles on shutdown.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_rule_sync(
                self.sync.clone(),
                self.config.sync.rules_interval(),
                self.trigger.clone(),
            ),
            spawn_expiry_watch(self.entitlement.clone(), self.config.entitlement.expiry_poll()),
        ]
    }

    /// Host app came to the foreground: refresh rules now and, when signed
    /// in, re-read the server entitlement in the background.
    pub fn foreground(&self) -> Option<JoinHandle<()>> {
        self.trigger.foreground();
        if !matches!(self.session.is_logged_in(), Ok(true)) {
            return None;
        }
        let account = self.account.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = account.reconcile_profile().await {
                tracing::warn!(target: "entitlement", error = %e, "profile reconciliation failed");
            }
        }))
    }

    /// After sign-in: refresh rules, upload the profile, adopt the server
    /// entitlement and pull the full history.
    pub fn after_sign_in(&self) -> JoinHandle<()> {
        let sync = self.sync.clone();
        let account = self.account.clone();
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            sync.refresh_logged().await;
            if let Err(e) = account.reconcile_profile().await {
                tracing::warn!(target: "entitlement", error = %e, "profile reconciliation failed");
            }
            let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default();
            if let Err(e) = ledger.pull_history(epoch, Utc::now()).await {
                tracing::warn!(target: "ledger", error = %e, "history pull failed");
            }
        })
    }
}
