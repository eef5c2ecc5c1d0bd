//! Transaction repository: local-authoritative writes plus a detached push to
//! the remote ledger.
//!
//! A record is "handled" once SQLite has it. The remote push runs on its own
//! task, is never awaited by the caller and is not retried; a later
//! [`TransactionRepository::pull_history`] fills whatever the mirror missed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{StoreError, SyncError};
use crate::extract::ExtractedTransaction;
use crate::range::TimeRange;
use crate::remote::{LedgerApi, LedgerEntry};
use crate::rules::RuleSnapshot;
use crate::store::session::Session;
use crate::store::{Inserted, RecordId, Store, TransactionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    New(RecordId),
    /// Same host dedup key already stored; nothing written.
    Duplicate(RecordId),
}

impl Recorded {
    pub fn id(self) -> RecordId {
        match self {
            Recorded::New(id) | Recorded::Duplicate(id) => id,
        }
    }
}

impl From<Inserted> for Recorded {
    fn from(i: Inserted) -> Self {
        match i {
            Inserted::New(id) => Recorded::New(id),
            Inserted::Existing(id) => Recorded::Duplicate(id),
        }
    }
}

/// One app's slice of a period total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppShare {
    pub app: String,
    pub total: f64,
    /// 0.0..=1.0 of the period total.
    pub share: f64,
}

#[derive(Clone)]
pub struct TransactionRepository {
    session: Session,
    ledger: Option<Arc<dyn LedgerApi>>,
}

impl TransactionRepository {
    pub fn new(session: Session, ledger: Option<Arc<dyn LedgerApi>>) -> Self {
        Self { session, ledger }
    }

    pub fn store(&self) -> &Arc<Store> {
        self.session.store()
    }

    /// Durable local write only. Used inside the entitlement critical section.
    pub fn write_local(
        &self,
        tx: &ExtractedTransaction,
        dedup_key: Option<&str>,
    ) -> Result<Recorded, StoreError> {
        let rec = Recorded::from(self.store().insert_transaction(tx, dedup_key)?);
        match rec {
            Recorded::New(id) => {
                counter!("transactions_recorded_total").increment(1);
                tracing::debug!(target: "ledger", %id, locked = tx.is_trial_limited, "transaction stored");
            }
            Recorded::Duplicate(id) => {
                counter!("transactions_duplicate_total").increment(1);
                tracing::debug!(target: "ledger", %id, "duplicate delivery ignored");
            }
        }
        Ok(rec)
    }

    /// Local write, then a detached remote push for new rows. Returns as soon
    /// as the local write is durable.
    pub fn record(
        &self,
        tx: &ExtractedTransaction,
        dedup_key: Option<&str>,
    ) -> Result<Recorded, StoreError> {
        let rec = self.write_local(tx, dedup_key)?;
        if let Recorded::New(_) = rec {
            self.push_detached(tx);
        }
        Ok(rec)
    }

    /// Fire-and-forget mirror of one transaction. Skipped without a signed-in
    /// user, a configured ledger or a running tokio runtime. Failures are
    /// logged and counted, never surfaced.
    pub fn push_detached(&self, tx: &ExtractedTransaction) -> Option<JoinHandle<()>> {
        let ledger = self.ledger.clone()?;
        let identity = match self.session.identity() {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!(target: "ledger", "not signed in; remote push skipped");
                return None;
            }
            Err(e) => {
                tracing::warn!(target: "ledger", error = %e, "session unreadable; remote push skipped");
                return None;
            }
        };
        let handle = Handle::try_current().ok()?;
        let entry = LedgerEntry::from_transaction(&identity.uid, tx);
        Some(handle.spawn(async move {
            if let Err(e) = ledger.push(&identity.token, std::slice::from_ref(&entry)).await {
                counter!("ledger_push_errors_total").increment(1);
                tracing::warn!(target: "ledger", error = %e, "remote ledger push failed; local copy kept");
            }
        }))
    }

    /// Remove one local row. The remote mirror is left as is.
    pub fn delete(&self, id: RecordId) -> Result<bool, StoreError> {
        let removed = self.store().delete_transaction(id)?;
        if removed {
            tracing::info!(target: "ledger", %id, "transaction deleted");
        }
        Ok(removed)
    }

    /// Clear the lock flag on every row. Idempotent.
    pub fn unlock_all(&self) -> Result<usize, StoreError> {
        let n = self.store().unlock_all()?;
        tracing::info!(target: "ledger", unlocked = n, "locked transactions released");
        Ok(n)
    }

    /// Delete locked rows older than `now - max_age`.
    pub fn sweep_expired_locked(
        &self,
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    ) -> Result<usize, StoreError> {
        let n = self.store().sweep_locked_before(now - max_age)?;
        counter!("locked_swept_total").increment(n as u64);
        if n > 0 {
            tracing::info!(target: "ledger", swept = n, "expired locked transactions removed");
        }
        Ok(n)
    }

    /// Pull the signed-in user's remote history for `[start, end]` and merge it
    /// locally. Returns rows added.
    pub async fn pull_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        let Some(ledger) = self.ledger.as_ref() else {
            return Ok(0);
        };
        let identity = self.session.identity()?.ok_or(SyncError::NotSignedIn)?;
        let rows = ledger
            .pull(
                &identity.token,
                &identity.uid,
                start.timestamp_millis(),
                end.timestamp_millis(),
            )
            .await?;
        let fetched = rows.len();
        let txs: Vec<ExtractedTransaction> = rows
            .into_iter()
            .map(LedgerEntry::into_transaction)
            .filter(|t| t.amount > 0.0)
            .collect();
        let added = self.store().insert_history(&txs)?;
        tracing::info!(target: "ledger", fetched, added, "history pulled");
        Ok(added)
    }

    pub fn transactions_in(&self, range: TimeRange) -> Result<Vec<TransactionRecord>, StoreError> {
        self.store().transactions_between(range.start, range.end)
    }

    pub fn total_in(&self, range: TimeRange) -> Result<f64, StoreError> {
        self.store().total_between(range.start, range.end)
    }

    /// Per-app totals for `range`, largest first. Apps are labelled with the
    /// display name of the rule watching their package.
    pub fn app_share(
        &self,
        range: TimeRange,
        rules: &RuleSnapshot,
    ) -> Result<Vec<AppShare>, StoreError> {
        let rows = self.transactions_in(range)?;
        let mut by_app: BTreeMap<String, f64> = BTreeMap::new();
        for r in &rows {
            *by_app
                .entry(rules.display_name_for(&r.source_app).to_string())
                .or_default() += r.amount;
        }
        let grand: f64 = by_app.values().sum();
        let mut out: Vec<AppShare> = by_app
            .into_iter()
            .map(|(app, total)| AppShare {
                share: if grand > 0.0 { total / grand } else { 0.0 },
                app,
                total,
            })
            .collect();
        out.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.app.cmp(&b.app)));
        Ok(out)
    }
}
