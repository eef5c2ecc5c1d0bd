//! Per-event orchestration: extract → entitlement → local write → speech.
//!
//! The entitlement decision and the local write happen inside one
//! [`Entitlement::transact`] call, so the trial unit charged and the record
//! persisted always belong to the same event. The remote push and speech
//! both run after the lock is released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;

use crate::entitlement::{Entitlement, Settlement};
use crate::error::{PipelineError, StoreError};
use crate::extract::{ExtractionEngine, InboundEvent};
use crate::ledger::{Recorded, TransactionRepository};
use crate::store::RecordId;

/// Speech output collaborator. Fire-and-forget.
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}

/// Writes what would be spoken to the log. Used when no audio sink is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSpeaker;

impl Speaker for LogSpeaker {
    fn speak(&self, text: &str) {
        tracing::info!(target: "pipeline", text, "speak");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// No rule, no amount, or amount zero.
    Ignored,
    /// Host delivered the same notification again.
    Duplicate { record_id: RecordId },
    Recorded {
        record_id: RecordId,
        amount: f64,
        trial_limited: bool,
        /// Text handed to the speaker, `None` when the alert was suppressed.
        spoken: Option<String>,
    },
}

pub struct Pipeline {
    engine: ExtractionEngine,
    entitlement: Arc<Entitlement>,
    ledger: TransactionRepository,
    speaker: Arc<dyn Speaker>,
}

impl Pipeline {
    pub fn new(
        engine: ExtractionEngine,
        entitlement: Arc<Entitlement>,
        ledger: TransactionRepository,
        speaker: Arc<dyn Speaker>,
    ) -> Self {
        Self {
            engine,
            entitlement,
            ledger,
            speaker,
        }
    }

    pub fn ledger(&self) -> &TransactionRepository {
        &self.ledger
    }

    /// Start-up housekeeping: drop locked records older than `max_age`.
    pub fn start(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> Result<usize, StoreError> {
        self.ledger.sweep_expired_locked(now, max_age)
    }

    /// Process one notification. A storage failure drops the event and is
    /// returned; nothing is spoken or pushed in that case.
    pub fn handle(&self, event: InboundEvent) -> Result<Outcome, PipelineError> {
        counter!("notifications_received_total").increment(1);

        let Some(extraction) = self.engine.extract(&event) else {
            return Ok(Outcome::Ignored);
        };
        counter!("notifications_matched_total").increment(1);

        let mut tx = extraction.transaction;
        let rule = extraction.rule;
        let dedup_key = event.dedup_key.as_deref();

        let (admission, recorded) =
            self.entitlement
                .transact::<_, PipelineError, _>(Utc::now(), |admission| {
                    tx.is_trial_limited = admission.is_trial_limited();
                    Ok(match self.ledger.write_local(&tx, dedup_key)? {
                        r @ Recorded::New(_) => Settlement::Charged(r),
                        r @ Recorded::Duplicate(_) => Settlement::Waived(r),
                    })
                })?;

        let record_id = match recorded {
            Recorded::Duplicate(record_id) => return Ok(Outcome::Duplicate { record_id }),
            Recorded::New(id) => id,
        };

        tracing::info!(
            target: "pipeline",
            %record_id,
            msg_id = %short_id(&tx.raw_message),
            app = %rule.display_name,
            amount = tx.amount,
            locked = tx.is_trial_limited,
            "payment notification recorded"
        );

        self.ledger.push_detached(&tx);

        let spoken = if admission.may_sound {
            let text = render_speech(&rule.speech_template, tx.amount, &rule.display_name);
            self.speaker.speak(&text);
            Some(text)
        } else {
            counter!("speech_suppressed_total").increment(1);
            tracing::info!(target: "pipeline", %record_id, "trial exhausted; alert suppressed");
            None
        };

        Ok(Outcome::Recorded {
            record_id,
            amount: tx.amount,
            trial_limited: tx.is_trial_limited,
            spoken,
        })
    }
}

/// Fill `{amount}` (whole number, no grouping) and `{app_name}`.
pub fn render_speech(template: &str, amount: f64, app_name: &str) -> String {
    template
        .replace("{amount}", &format!("{amount:.0}"))
        .replace("{app_name}", app_name)
}

fn short_id(text: &str) -> String {
    let mut fp = crate::rules::fingerprint(text);
    fp.truncate(12);
    fp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speech_template_fills_both_placeholders() {
        assert_eq!(
            render_speech("Diterima {amount} rupiah dari {app_name}", 75000.0, "DANA"),
            "Diterima 75000 rupiah dari DANA"
        );
        assert_eq!(render_speech("tanpa tag", 1.0, "x"), "tanpa tag");
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let v = serde_json::to_value(Outcome::Duplicate {
            record_id: RecordId(4),
        })
        .unwrap();
        assert_eq!(v["outcome"], "duplicate");
        assert_eq!(v["record_id"], 4);
    }
}
