// src/rules/sync.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::RuleCache;
use crate::error::SyncError;
use crate::remote::RuleSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { count: usize },
    Unchanged,
}

/// Pulls the full rule list from the config endpoint into the cache.
pub struct RuleSynchronizer {
    source: Arc<dyn RuleSource>,
    cache: Arc<RuleCache>,
}

impl RuleSynchronizer {
    pub fn new(source: Arc<dyn RuleSource>, cache: Arc<RuleCache>) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &Arc<RuleCache> {
        &self.cache
    }

    /// Fetch and install the rule set. The cache is written only when the
    /// fingerprint changed; on any error the previous set stays live.
    pub async fn refresh(&self) -> Result<RefreshOutcome, SyncError> {
        let rules = self.source.fetch_rules().await?;
        let count = rules.len();
        if self.cache.replace_if_changed(rules)? {
            Ok(RefreshOutcome::Updated { count })
        } else {
            Ok(RefreshOutcome::Unchanged)
        }
    }

    /// `refresh` with the failure policy applied: errors are logged and dropped.
    pub async fn refresh_logged(&self) -> Option<RefreshOutcome> {
        counter!("rules_sync_total").increment(1);
        match self.refresh().await {
            Ok(outcome) => {
                match outcome {
                    RefreshOutcome::Updated { count } => {
                        tracing::info!(target: "rules", count, "rule set updated from server");
                    }
                    RefreshOutcome::Unchanged => {
                        tracing::debug!(target: "rules", "rule set unchanged");
                    }
                }
                gauge!("rules_last_sync_ts").set(chrono::Utc::now().timestamp() as f64);
                Some(outcome)
            }
            Err(e) => {
                counter!("rules_sync_errors_total").increment(1);
                tracing::warn!(target: "rules", error = %e, "rule sync failed; keeping cached rules");
                None
            }
        }
    }
}

/// Wakes the sync loop early, e.g. when the host app comes to the foreground.
#[derive(Debug, Clone, Default)]
pub struct RuleSyncTrigger {
    notify: Arc<Notify>,
}

impl RuleSyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn foreground(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Refresh immediately, then every `interval`, and additionally whenever the
/// trigger fires. Abort the handle to stop; no in-flight completion is awaited.
pub fn spawn_rule_sync(
    sync: Arc<RuleSynchronizer>,
    interval: Duration,
    trigger: RuleSyncTrigger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.wait() => {
                    tracing::debug!(target: "rules", "foreground refresh requested");
                }
            }
            sync.refresh_logged().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::rules::tests::rule;
    use crate::rules::Rule;
    use crate::store::{session::Session, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        replies: Mutex<Vec<Result<Vec<Rule>, RemoteError>>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RuleSource for ScriptedSource {
        async fn fetch_rules(&self) -> Result<Vec<Rule>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut r = self.replies.lock().unwrap();
            if r.is_empty() {
                Ok(vec![])
            } else {
                r.remove(0)
            }
        }
    }

    fn setup(replies: Vec<Result<Vec<Rule>, RemoteError>>) -> (Arc<ScriptedSource>, RuleSynchronizer) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(RuleCache::load(Session::new(store)).unwrap());
        let src = Arc::new(ScriptedSource {
            replies: Mutex::new(replies),
            calls: AtomicUsize::new(0),
        });
        (src.clone(), RuleSynchronizer::new(src, cache))
    }

    #[tokio::test]
    async fn identical_payload_twice_writes_once() {
        let rules = vec![rule(1, "dana", r"Rp\s?([\d.]+)")];
        let (_src, sync) = setup(vec![Ok(rules.clone()), Ok(rules)]);
        assert_eq!(
            sync.refresh().await.unwrap(),
            RefreshOutcome::Updated { count: 1 }
        );
        let gen = sync.cache().snapshot().generation();
        assert_eq!(sync.refresh().await.unwrap(), RefreshOutcome::Unchanged);
        assert_eq!(sync.cache().snapshot().generation(), gen);
    }

    #[tokio::test]
    async fn outage_keeps_previous_rules() {
        let rules = vec![rule(1, "dana", r"Rp\s?([\d.]+)")];
        let (_src, sync) = setup(vec![
            Ok(rules),
            Err(RemoteError::Status {
                endpoint: "config/rules",
                status: 503,
            }),
        ]);
        sync.refresh().await.unwrap();
        assert!(sync.refresh_logged().await.is_none());
        assert!(sync.cache().snapshot().watches("id.dana"));
    }

    #[tokio::test(start_paused = true)]
    async fn foreground_trigger_forces_refresh() {
        let (src, sync) = setup(vec![]);
        let trigger = RuleSyncTrigger::new();
        let handle = spawn_rule_sync(Arc::new(sync), Duration::from_secs(43_200), trigger.clone());

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);

        trigger.foreground();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }
}
