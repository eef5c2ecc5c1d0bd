// src/api.rs
//! Loopback ingress for the notification bridge and the host UI.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::account::Purchase;
use crate::app::App;
use crate::entitlement::EntitlementView;
use crate::error::{AccountError, PipelineError, StoreError};
use crate::extract::InboundEvent;
use crate::ledger::AppShare;
use crate::metrics::Metrics;
use crate::pipeline::Outcome;
use crate::range::{DateFilter, TimeRange};
use crate::store::profile::UserProfile;
use crate::store::session::Identity;
use crate::store::{RecordId, TransactionRecord};

pub fn router(app: App, metrics: Option<Metrics>) -> Router {
    let mut r = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/notifications", post(notify))
        .route("/app/foreground", post(foreground))
        .route("/session", get(session).put(sign_in).delete(sign_out))
        .route("/entitlement", get(entitlement))
        .route("/entitlement/purchase", post(purchase))
        .route("/transactions", get(transactions))
        .route("/transactions/{id}", delete(delete_transaction));
    if let Some(m) = metrics {
        r = r.merge(m.router());
    }
    r.layer(CorsLayer::very_permissive()).with_state(app)
}

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    Account(AccountError),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Store(s) => ApiError::Store(s),
        }
    }
}

impl From<AccountError> for ApiError {
    fn from(e: AccountError) -> Self {
        ApiError::Account(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::Store(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            ApiError::Account(AccountError::NotSignedIn) => {
                (StatusCode::UNAUTHORIZED, "not signed in".to_string())
            }
            ApiError::Account(AccountError::Rejected(s)) => {
                (StatusCode::PAYMENT_REQUIRED, format!("upgrade rejected: {s}"))
            }
            ApiError::Account(AccountError::Remote(e)) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ApiError::Account(AccountError::Store(e)) => {
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        if status.is_server_error() {
            tracing::warn!(target: "api", %status, error = %msg, "request failed");
        }
        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct NotificationIn {
    package: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    big_text: Option<String>,
    /// Epoch millis; "now" when absent.
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    key: Option<String>,
}

async fn notify(
    State(app): State<App>,
    Json(body): Json<NotificationIn>,
) -> Result<Json<Outcome>, ApiError> {
    let received_at = body
        .timestamp
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let mut event = InboundEvent::from_notification(
        body.package,
        body.title.as_deref(),
        body.text.as_deref(),
        body.big_text.as_deref(),
        received_at,
    );
    event.dedup_key = body.key.filter(|k| !k.is_empty());

    // SQLite work happens under the entitlement lock; keep it off the reactor.
    let pipeline = app.pipeline.clone();
    let outcome = tokio::task::spawn_blocking(move || pipeline.handle(event))
        .await
        .map_err(|e| ApiError::Internal(format!("pipeline task: {e}")))??;
    Ok(Json(outcome))
}

async fn foreground(State(app): State<App>) -> StatusCode {
    app.foreground();
    StatusCode::ACCEPTED
}

async fn sign_in(State(app): State<App>, Json(id): Json<Identity>) -> Result<StatusCode, ApiError> {
    if id.token.trim().is_empty() || id.uid.trim().is_empty() {
        return Err(ApiError::BadRequest("token and uid are required".into()));
    }
    app.account.sign_in(&id)?;
    app.after_sign_in();
    Ok(StatusCode::NO_CONTENT)
}

async fn session(State(app): State<App>) -> Result<Json<Option<UserProfile>>, ApiError> {
    Ok(Json(app.account.profile()?))
}

async fn sign_out(State(app): State<App>) -> Result<StatusCode, ApiError> {
    app.account.sign_out()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn entitlement(State(app): State<App>) -> Result<Json<EntitlementView>, ApiError> {
    Ok(Json(app.entitlement.view(Utc::now())?))
}

async fn purchase(
    State(app): State<App>,
    Json(p): Json<Purchase>,
) -> Result<Json<EntitlementView>, ApiError> {
    let st = app.account.purchase(Utc::now(), &p).await?;
    Ok(Json(st.into()))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    #[serde(default)]
    range: Option<String>,
}

#[derive(Serialize)]
struct TransactionsOut {
    range: DateFilter,
    window: TimeRange,
    total: f64,
    apps: Vec<AppShare>,
    transactions: Vec<TransactionRecord>,
}

async fn transactions(
    State(app): State<App>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<TransactionsOut>, ApiError> {
    let filter = match q.range.as_deref() {
        None | Some("") => DateFilter::default(),
        Some(s) => s.parse::<DateFilter>().map_err(ApiError::BadRequest)?,
    };
    let window = filter.range_local();
    let snapshot = app.rules.snapshot();
    Ok(Json(TransactionsOut {
        range: filter,
        window,
        total: app.ledger.total_in(window)?,
        apps: app.ledger.app_share(window, &snapshot)?,
        transactions: app.ledger.transactions_in(window)?,
    }))
}

async fn delete_transaction(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if app.ledger.delete(RecordId(id))? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no transaction {id}")))
    }
}
