//! Trial / premium entitlement.
//!
//! One owned [`EntitlementState`] behind a mutex. Every read-decide-decrement
//! goes through [`Entitlement::transact`], which holds the lock for the whole
//! sequence so two overlapping notifications can never both spend the same
//! trial unit.
//!
//! Reconciliation: a value reported by the server overwrites everything
//! local ([`Entitlement::apply_server`]). A locally granted premium period
//! ([`Entitlement::grant_bridge`]) is only a placeholder until that happens.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::remote::ServerEntitlement;
use crate::store::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementState {
    pub is_premium: bool,
    pub remaining_trial: u32,
    /// Ignored while `is_premium` is false. `None` on a premium state means
    /// no end date is known.
    pub premium_expires_at: Option<DateTime<Utc>>,
}

impl EntitlementState {
    /// Pure eligibility check. Call before any decrement.
    pub fn may_sound(&self) -> bool {
        self.is_premium || self.remaining_trial > 0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && self.premium_expires_at.is_some_and(|exp| now > exp)
    }

    pub fn tier(&self) -> Tier {
        if self.is_premium {
            Tier::Premium
        } else if self.remaining_trial > 0 {
            Tier::TrialActive {
                remaining: self.remaining_trial,
            }
        } else {
            Tier::TrialExhausted
        }
    }

    fn expire(&mut self) {
        self.is_premium = false;
        self.remaining_trial = 0;
        self.premium_expires_at = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Tier {
    Premium,
    TrialActive { remaining: u32 },
    TrialExhausted,
}

/// What the entitlement allows for one event, decided under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub may_sound: bool,
    /// True when the event is eligible only because of the trial; charging it
    /// spends one unit.
    pub consumes_trial: bool,
}

impl Admission {
    fn from_state(s: &EntitlementState) -> Self {
        Self {
            may_sound: s.may_sound(),
            consumes_trial: !s.is_premium && s.remaining_trial > 0,
        }
    }

    /// Lock flag for the record produced by this event.
    pub fn is_trial_limited(&self) -> bool {
        !self.may_sound
    }
}

/// Result of the work done inside [`Entitlement::transact`]: whether the
/// event should be billed against the trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T> {
    Charged(T),
    /// e.g. a duplicate delivery
    Waived(T),
}

/// Snapshot for the UI / API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitlementView {
    #[serde(flatten)]
    pub tier: Tier,
    pub is_premium: bool,
    pub remaining_trial: u32,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub may_sound: bool,
}

impl From<EntitlementState> for EntitlementView {
    fn from(s: EntitlementState) -> Self {
        Self {
            tier: s.tier(),
            is_premium: s.is_premium,
            remaining_trial: s.remaining_trial,
            premium_expires_at: s.premium_expires_at,
            may_sound: s.may_sound(),
        }
    }
}

#[derive(Debug)]
pub struct Entitlement {
    state: Mutex<EntitlementState>,
    session: Session,
}

impl Entitlement {
    pub fn load(session: Session) -> Result<Self, StoreError> {
        let state = session.load_entitlement()?;
        tracing::info!(
            target: "entitlement",
            premium = state.is_premium,
            remaining = state.remaining_trial,
            "entitlement loaded"
        );
        Ok(Self {
            state: Mutex::new(state),
            session,
        })
    }

    fn lock(&self) -> MutexGuard<'_, EntitlementState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply lazy expiry to a locked state. Returns whether it fired.
    fn settle_expiry(
        &self,
        guard: &mut MutexGuard<'_, EntitlementState>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !guard.is_expired(now) {
            return Ok(false);
        }
        let expired_at = guard.premium_expires_at;
        guard.expire();
        counter!("entitlement_expired_total").increment(1);
        tracing::info!(target: "entitlement", ?expired_at, "premium expired");
        self.session.save_entitlement(&**guard)?;
        Ok(true)
    }

    /// Current state with expiry evaluated at `now`.
    pub fn current(&self, now: DateTime<Utc>) -> Result<EntitlementState, StoreError> {
        let mut g = self.lock();
        self.settle_expiry(&mut g, now)?;
        Ok(*g)
    }

    pub fn view(&self, now: DateTime<Utc>) -> Result<EntitlementView, StoreError> {
        self.current(now).map(EntitlementView::from)
    }

    /// Evaluate expiry without reading anything else. True if premium ended now.
    pub fn check_expiry(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut g = self.lock();
        self.settle_expiry(&mut g, now)
    }

    /// Run `f` inside the entitlement critical section.
    ///
    /// `f` sees the [`Admission`] computed from the state at `now`. When the
    /// admission consumes a trial unit, the decremented counter is persisted
    /// before `f` runs, so a row written by `f` never outlives an unspent
    /// unit. If `f` fails or returns [`Settlement::Waived`], the persisted
    /// counter is put back and nothing is spent.
    pub fn transact<T, E, F>(&self, now: DateTime<Utc>, f: F) -> Result<(Admission, T), E>
    where
        F: FnOnce(Admission) -> Result<Settlement<T>, E>,
        E: From<StoreError>,
    {
        let mut g = self.lock();
        self.settle_expiry(&mut g, now)?;
        let admission = Admission::from_state(&g);

        let charged = admission.consumes_trial.then(|| EntitlementState {
            remaining_trial: g.remaining_trial - 1,
            ..*g
        });
        if let Some(next) = &charged {
            self.session.save_entitlement(next)?;
        }

        match f(admission) {
            Ok(Settlement::Charged(v)) => {
                if let Some(next) = charged {
                    *g = next;
                    counter!("trial_consumed_total").increment(1);
                    tracing::debug!(target: "entitlement", remaining = g.remaining_trial, "trial unit consumed");
                }
                Ok((admission, v))
            }
            Ok(Settlement::Waived(v)) => {
                self.restore_persisted(&g, charged.is_some());
                Ok((admission, v))
            }
            Err(e) => {
                self.restore_persisted(&g, charged.is_some());
                Err(e)
            }
        }
    }

    /// Undo a pre-persisted charge. The in-memory state stays authoritative
    /// and is written again on the next successful save.
    fn restore_persisted(&self, state: &EntitlementState, charged: bool) {
        if !charged {
            return;
        }
        if let Err(e) = self.session.save_entitlement(state) {
            tracing::warn!(target: "entitlement", error = %e, "could not roll back trial counter");
        }
    }

    /// Server-reported entitlement overwrites local counters wholesale.
    pub fn apply_server(&self, server: &ServerEntitlement) -> Result<EntitlementState, StoreError> {
        let mut g = self.lock();
        let next = EntitlementState {
            is_premium: server.is_premium,
            remaining_trial: server.remaining_trial,
            premium_expires_at: server.expires_at,
        };
        if *g != next {
            tracing::info!(
                target: "entitlement",
                premium = next.is_premium,
                remaining = next.remaining_trial,
                "entitlement replaced by server value"
            );
        }
        self.session.save_entitlement(&next)?;
        *g = next;
        Ok(next)
    }

    /// Optimistic premium until the server confirms: expiry `now + bridge`.
    /// A confirmed expiry later than the bridge is kept.
    pub fn grant_bridge(
        &self,
        now: DateTime<Utc>,
        bridge: chrono::Duration,
    ) -> Result<EntitlementState, StoreError> {
        let mut g = self.lock();
        let estimate = now + bridge;
        let keep_existing = g.is_premium
            && !g.is_expired(now)
            && g.premium_expires_at.map_or(true, |exp| exp >= estimate);
        if keep_existing {
            return Ok(*g);
        }
        let next = EntitlementState {
            is_premium: true,
            remaining_trial: 0,
            premium_expires_at: Some(estimate),
        };
        self.session.save_entitlement(&next)?;
        *g = next;
        tracing::info!(target: "entitlement", expires_at = %estimate, "premium bridge granted");
        Ok(next)
    }

    /// Upgrade confirmed by the server: premium with the server's expiry.
    /// `None` keeps whatever expiry is already recorded.
    pub fn confirm_premium(
        &self,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<EntitlementState, StoreError> {
        let mut g = self.lock();
        let next = EntitlementState {
            is_premium: true,
            remaining_trial: 0,
            premium_expires_at: expires_at.or(g.premium_expires_at),
        };
        self.session.save_entitlement(&next)?;
        *g = next;
        tracing::info!(target: "entitlement", expires_at = ?next.premium_expires_at, "premium confirmed by server");
        Ok(next)
    }

    /// Forget local counters (sign-out). Persisted state is cleared by the session.
    pub fn reset(&self) {
        *self.lock() = EntitlementState::default();
    }
}

/// Re-check expiry every `poll` while a premium subscription with a known
/// end date is active. Abort the handle to stop.
pub fn spawn_expiry_watch(ent: Arc<Entitlement>, poll: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let watching = {
                let g = ent.lock();
                g.is_premium && g.premium_expires_at.is_some()
            };
            if !watching {
                continue;
            }
            if let Err(e) = ent.check_expiry(Utc::now()) {
                tracing::warn!(target: "entitlement", error = %e, "expiry check could not persist");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn ent_with(state: EntitlementState) -> Entitlement {
        let session = Session::new(Arc::new(Store::open_in_memory().unwrap()));
        session.save_entitlement(&state).unwrap();
        Entitlement::load(session).unwrap()
    }

    fn trial(n: u32) -> EntitlementState {
        EntitlementState {
            remaining_trial: n,
            ..Default::default()
        }
    }

    fn charge(e: &Entitlement, now: DateTime<Utc>) -> Admission {
        e.transact::<_, StoreError, _>(now, |_| Ok(Settlement::Charged(())))
            .unwrap()
            .0
    }

    #[test]
    fn trial_counts_down_then_locks() {
        let e = ent_with(trial(2));
        let now = Utc::now();
        let a = charge(&e, now);
        assert!(a.may_sound && a.consumes_trial);
        let b = charge(&e, now);
        assert!(b.may_sound, "last unit still sounds");
        let c = charge(&e, now);
        assert!(!c.may_sound && !c.consumes_trial);
        assert!(c.is_trial_limited());
        assert_eq!(e.current(now).unwrap().tier(), Tier::TrialExhausted);
    }

    #[test]
    fn waived_and_failed_work_does_not_charge() {
        let e = ent_with(trial(1));
        let now = Utc::now();
        e.transact::<_, StoreError, _>(now, |_| Ok(Settlement::Waived(())))
            .unwrap();
        let r = e.transact::<(), StoreError, _>(now, |_| Err(StoreError::Poisoned));
        assert!(r.is_err());
        assert_eq!(e.current(now).unwrap().remaining_trial, 1);
    }

    #[test]
    fn counter_is_durable_before_the_work_runs() {
        let e = ent_with(trial(2));
        let now = Utc::now();
        e.transact::<_, StoreError, _>(now, |_| {
            assert_eq!(e.session.load_entitlement()?.remaining_trial, 1);
            Ok(Settlement::Charged(()))
        })
        .unwrap();
        assert_eq!(e.session.load_entitlement().unwrap().remaining_trial, 1);

        let r = e.transact::<(), StoreError, _>(now, |_| Err(StoreError::Poisoned));
        assert!(r.is_err());
        assert_eq!(e.session.load_entitlement().unwrap().remaining_trial, 1);
        e.transact::<_, StoreError, _>(now, |_| Ok(Settlement::Waived(())))
            .unwrap();
        assert_eq!(e.session.load_entitlement().unwrap().remaining_trial, 1);
        assert_eq!(e.current(now).unwrap().remaining_trial, 1);
    }

    #[test]
    fn premium_never_consumes_trial() {
        let e = ent_with(EntitlementState {
            is_premium: true,
            remaining_trial: 3,
            premium_expires_at: None,
        });
        let a = charge(&e, Utc::now());
        assert!(a.may_sound && !a.consumes_trial);
        assert_eq!(e.current(Utc::now()).unwrap().remaining_trial, 3);
    }

    #[test]
    fn expired_premium_drops_to_exhausted_on_next_read() {
        let now = Utc::now();
        let e = ent_with(EntitlementState {
            is_premium: true,
            remaining_trial: 4,
            premium_expires_at: Some(now - chrono::Duration::milliseconds(1000)),
        });
        let st = e.current(now).unwrap();
        assert_eq!(
            st,
            EntitlementState {
                is_premium: false,
                remaining_trial: 0,
                premium_expires_at: None
            }
        );
        // persisted too
        assert_eq!(e.session.load_entitlement().unwrap(), st);
    }

    #[test]
    fn expiry_is_ignored_when_not_premium() {
        let now = Utc::now();
        let e = ent_with(EntitlementState {
            is_premium: false,
            remaining_trial: 2,
            premium_expires_at: Some(now - chrono::Duration::days(1)),
        });
        assert!(!e.check_expiry(now).unwrap());
        assert_eq!(e.current(now).unwrap().remaining_trial, 2);
    }

    #[test]
    fn server_value_overwrites_bridge() {
        let now = Utc::now();
        let e = ent_with(trial(5));
        let bridged = e.grant_bridge(now, chrono::Duration::days(30)).unwrap();
        assert!(bridged.is_premium);
        assert_eq!(bridged.remaining_trial, 0);

        let server_exp = now + chrono::Duration::days(31);
        let st = e
            .apply_server(&ServerEntitlement {
                is_premium: true,
                remaining_trial: 0,
                expires_at: Some(server_exp),
            })
            .unwrap();
        assert_eq!(st.premium_expires_at, Some(server_exp));

        // A second bridge does not shorten a confirmed longer period.
        let again = e.grant_bridge(now, chrono::Duration::days(30)).unwrap();
        assert_eq!(again.premium_expires_at, Some(server_exp));
    }

    #[test]
    fn confirm_premium_keeps_bridge_when_server_omits_expiry() {
        let now = Utc::now();
        let e = ent_with(trial(0));
        let b = e.grant_bridge(now, chrono::Duration::days(30)).unwrap();
        let c = e.confirm_premium(None).unwrap();
        assert_eq!(c.premium_expires_at, b.premium_expires_at);
    }

    #[test]
    fn view_flattens_tier() {
        let v = EntitlementView::from(trial(3));
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["state"], "trial_active");
        assert_eq!(json["remaining"], 3);
        assert_eq!(json["may_sound"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_expires_premium_without_any_event() {
        let e = Arc::new(ent_with(EntitlementState {
            is_premium: true,
            remaining_trial: 0,
            premium_expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        }));
        let h = spawn_expiry_watch(e.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!e.lock().is_premium);
        h.abort();
    }
}
