use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{CaseId, Role, Transaction},
    error::{ApiError, ErrorCode},
    protocol::{ActionBody, CreateCaseResponse, SessionProfile, TrustAction},
};
use storage::TrustStore;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiContext {
    pub store: TrustStore,
    /// Span granted for payment once the buyer confirms the contract step.
    pub payment_window: Duration,
    /// Lifetime of a minted one-time exchange token.
    pub token_ttl: Duration,
}

pub const ACTION_ENDPOINTS: [&str; 6] = [
    "submit",
    "confirm",
    "payment",
    "checklist",
    "supplement",
    "reset",
];

/// Current state of a case. The expiry rule runs lazily here, so a client
/// polling the status observes the payment window closing without any server
/// timer.
pub async fn status(ctx: &ApiContext, case_id: &CaseId) -> Result<Transaction, ApiError> {
    let mut tx = ctx
        .store
        .load_case(case_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("case not found"))?;
    if workflow::expire_if_overdue(&mut tx, Utc::now()) {
        ctx.store.save_case(&tx).await.map_err(internal)?;
        info!(case = %case_id, "payment window expired");
    }
    Ok(tx)
}

/// Runs one action against a case with the role the session vouches for.
pub async fn dispatch_action(
    ctx: &ApiContext,
    endpoint: &str,
    case_id: &CaseId,
    role: Role,
    body: ActionBody,
) -> Result<Transaction, ApiError> {
    let mut tx = ctx
        .store
        .load_case(case_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("case not found"))?;

    let now = Utc::now();
    if workflow::expire_if_overdue(&mut tx, now) {
        ctx.store.save_case(&tx).await.map_err(internal)?;
    }

    let action = TrustAction::from_body(endpoint, body, tx.current_step)
        .ok_or_else(|| ApiError::invalid_state("malformed action body"))?;
    let next = workflow::apply(&tx, &action, role, now, ctx.payment_window)?;
    ctx.store.save_case(&next).await.map_err(internal)?;
    info!(case = %case_id, action = endpoint, %role, "action applied");
    Ok(next)
}

/// Consumes a one-time exchange token. A second use, or a use past the
/// token's expiry, is rejected.
pub async fn exchange_session(ctx: &ApiContext, token: &str) -> Result<SessionProfile, ApiError> {
    match ctx
        .store
        .consume_exchange_token(token, Utc::now())
        .await
        .map_err(internal)?
    {
        Some((case_id, role)) => {
            info!(case = %case_id, %role, "exchange token consumed");
            Ok(SessionProfile { case_id, role })
        }
        None => Err(ApiError::unauthorized(
            "exchange token invalid, expired, or already used",
        )),
    }
}

/// System bridge: creates a case and mints one single-use entry token per
/// role. The main site shares these as links with the two parties.
pub async fn create_case(
    ctx: &ApiContext,
    requested_id: Option<String>,
) -> Result<CreateCaseResponse, ApiError> {
    let case_id = CaseId::new(requested_id.unwrap_or_else(|| format!("C-{}", Uuid::new_v4())));
    if ctx
        .store
        .load_case(&case_id)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(ApiError::invalid_state("case already exists"));
    }

    let tx = Transaction::initial(case_id.clone());
    ctx.store.save_case(&tx).await.map_err(internal)?;

    let expires_at = Utc::now() + ctx.token_ttl;
    let agent_token = Uuid::new_v4().to_string();
    let buyer_token = Uuid::new_v4().to_string();
    ctx.store
        .insert_exchange_token(&agent_token, &case_id, Role::Agent, expires_at)
        .await
        .map_err(internal)?;
    ctx.store
        .insert_exchange_token(&buyer_token, &case_id, Role::Buyer, expires_at)
        .await
        .map_err(internal)?;

    info!(case = %case_id, "case created with entry tokens");
    Ok(CreateCaseResponse {
        case_id,
        agent_token,
        buyer_token,
    })
}

const PAYMENT_ATTEMPT_WINDOW_SECS: i64 = 60;
const PAYMENT_ATTEMPT_MAX: usize = 10;

/// Per-case throttle for the payment endpoint.
#[derive(Default)]
pub struct PaymentLimiter {
    attempts: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl PaymentLimiter {
    pub fn allow(&self, case_id: &CaseId, now: DateTime<Utc>) -> bool {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = attempts.entry(case_id.as_str().to_string()).or_default();
        entry.retain(|at| (now - *at).num_seconds() < PAYMENT_ATTEMPT_WINDOW_SECS);
        if entry.len() >= PAYMENT_ATTEMPT_MAX {
            return false;
        }
        entry.push(now);
        true
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Unknown, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
