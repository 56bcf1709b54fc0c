use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{CaseId, Role, Transaction},
    error::{ApiError, ErrorCode},
    protocol::{ErrorBody, SessionExchangeRequest, SessionProfile, TrustAction},
};
use storage::TrustStore;
use tracing::{debug, warn};
use url::Url;

const SIMULATED_LATENCY: Duration = Duration::from_millis(600);
/// Demo payment window; the server grants twelve hours for real cases.
const SIMULATED_PAYMENT_WINDOW_SECS: i64 = 30;

/// Result of dispatching one action. Transport and precondition failures both
/// surface as `Rejected` so callers handle a single shape.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Applied(Transaction),
    Rejected(ApiError),
}

/// The one contract both backends satisfy. Calling code selects an adapter
/// per session and never mixes results from both within one case.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn fetch(&self, case_id: &CaseId) -> Result<Option<Transaction>, ApiError>;
    async fn dispatch(&self, case_id: &CaseId, role: Role, action: &TrustAction)
        -> DispatchOutcome;
    fn is_simulated(&self) -> bool {
        false
    }
}

/// Client-side backend: runs the transition table locally against the durable
/// store and mimics a network round-trip with an artificial delay.
///
/// Single-viewer only. Concurrent writers against the same store are
/// last-write-wins with no conflict detection.
pub struct SimulatedBackend {
    store: TrustStore,
    latency: Duration,
    payment_window: chrono::Duration,
}

impl SimulatedBackend {
    pub fn new(store: TrustStore) -> Self {
        Self {
            store,
            latency: SIMULATED_LATENCY,
            payment_window: chrono::Duration::seconds(SIMULATED_PAYMENT_WINDOW_SECS),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_payment_window(mut self, window: chrono::Duration) -> Self {
        self.payment_window = window;
        self
    }
}

#[async_trait]
impl BackendAdapter for SimulatedBackend {
    async fn fetch(&self, case_id: &CaseId) -> Result<Option<Transaction>, ApiError> {
        let mut tx = self
            .store
            .load_or_create(case_id)
            .await
            .map_err(store_error)?;
        // This fetch is the simulated authority: an elapsed deadline flips the
        // payment to expired right here and the flip is persisted.
        if workflow::expire_if_overdue(&mut tx, Utc::now()) {
            self.store.save_case(&tx).await.map_err(store_error)?;
        }
        Ok(Some(tx))
    }

    async fn dispatch(
        &self,
        case_id: &CaseId,
        role: Role,
        action: &TrustAction,
    ) -> DispatchOutcome {
        tokio::time::sleep(self.latency).await;

        let mut tx = match self.store.load_or_create(case_id).await {
            Ok(tx) => tx,
            Err(err) => return DispatchOutcome::Rejected(store_error(err)),
        };
        let now = Utc::now();
        if workflow::expire_if_overdue(&mut tx, now) {
            if let Err(err) = self.store.save_case(&tx).await {
                return DispatchOutcome::Rejected(store_error(err));
            }
        }

        match workflow::apply(&tx, action, role, now, self.payment_window) {
            Ok(next) => {
                if let Err(err) = self.store.save_case(&next).await {
                    return DispatchOutcome::Rejected(store_error(err));
                }
                debug!(case = %case_id, action = action.endpoint(), "simulated dispatch applied");
                DispatchOutcome::Applied(next)
            }
            Err(err) => DispatchOutcome::Rejected(err),
        }
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

fn store_error(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Unknown, err.to_string())
}

/// Remote backend: forwards actions to the server and trusts it to run the
/// identical transition table. The session rides on a cookie established by
/// the exchange endpoint.
pub struct RemoteBackend {
    http: Client,
    base_url: Url,
}

impl RemoteBackend {
    pub fn new(server_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(server_url)?;
        let http = Client::builder().cookie_store(true).build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    /// Consumes a one-time exchange token, establishing the cookie session.
    pub async fn exchange_session(&self, token: &str) -> Result<SessionProfile, ApiError> {
        let response = self
            .http
            .post(self.endpoint("/api/session/exchange"))
            .json(&SessionExchangeRequest {
                token: token.to_string(),
            })
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(network_error),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::unauthorized(
                "exchange token rejected by the server",
            )),
            status => Err(ApiError::new(
                ErrorCode::Unknown,
                format!("unexpected status {status} from session exchange"),
            )),
        }
    }

    /// The session the server currently recognizes for this client, if any.
    pub async fn current_session(&self) -> Result<Option<SessionProfile>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("/api/session/me"))
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::OK => response.json().await.map(Some).map_err(network_error),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status => Err(ApiError::new(
                ErrorCode::Unknown,
                format!("unexpected status {status} from session query"),
            )),
        }
    }
}

#[async_trait]
impl BackendAdapter for RemoteBackend {
    async fn fetch(&self, case_id: &CaseId) -> Result<Option<Transaction>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("/api/trust/status"))
            .query(&[("id", case_id.as_str())])
            .send()
            .await
            .map_err(network_error)?;

        match response.status() {
            StatusCode::OK => response.json().await.map(Some).map_err(network_error),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ApiError::unauthorized("session rejected by the server"))
            }
            status => Err(ApiError::new(
                ErrorCode::Unknown,
                format!("unexpected status {status} from status endpoint"),
            )),
        }
    }

    async fn dispatch(
        &self,
        case_id: &CaseId,
        _role: Role,
        action: &TrustAction,
    ) -> DispatchOutcome {
        // The server derives the role from its session; it is never sent.
        let path = format!("/api/trust/{}", action.endpoint());
        let response = match self
            .http
            .post(self.endpoint(&path))
            .query(&[("id", case_id.as_str())])
            .json(&action.to_body())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return DispatchOutcome::Rejected(network_error(err)),
        };

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return DispatchOutcome::Rejected(ApiError::unauthorized(
                "session rejected by the server",
            ));
        }

        let payload: serde_json::Value = match response.json().await {
            Ok(payload) => payload,
            Err(err) => return DispatchOutcome::Rejected(network_error(err)),
        };
        parse_dispatch_payload(payload)
    }
}

/// Accepts the `{ error }` failure body, the `{ success, state }` envelope,
/// and a bare transaction, in that order.
fn parse_dispatch_payload(payload: serde_json::Value) -> DispatchOutcome {
    if payload.get("error").is_some() {
        if let Ok(body) = serde_json::from_value::<ErrorBody>(payload.clone()) {
            let message = body.message.unwrap_or_else(|| body.error.clone());
            return DispatchOutcome::Rejected(ApiError::new(ErrorCode::parse(&body.error), message));
        }
    }
    if let Some(state) = payload.get("state") {
        if let Ok(tx) = serde_json::from_value::<Transaction>(state.clone()) {
            return DispatchOutcome::Applied(tx);
        }
    }
    match serde_json::from_value::<Transaction>(payload) {
        Ok(tx) => DispatchOutcome::Applied(tx),
        Err(err) => {
            warn!("dispatch response did not match any known shape: {err}");
            DispatchOutcome::Rejected(ApiError::new(
                ErrorCode::Unknown,
                "unrecognized dispatch response",
            ))
        }
    }
}

fn network_error(err: reqwest::Error) -> ApiError {
    ApiError::new(ErrorCode::Network, err.to_string())
}

#[cfg(test)]
#[path = "tests/adapter_tests.rs"]
mod tests;
