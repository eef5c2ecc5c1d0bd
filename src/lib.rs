// src/lib.rs
// Public library surface for the daemon and integration tests.

pub mod account;
pub mod api;
pub mod app;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod range;
pub mod remote;
pub mod rules;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::app::{App, Collaborators};
pub use crate::entitlement::{EntitlementState, EntitlementView, Tier};
pub use crate::extract::{ExtractedTransaction, InboundEvent};
pub use crate::pipeline::{Outcome, Speaker};
