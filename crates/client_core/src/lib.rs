use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{CaseId, PaymentStatus, Role, Transaction, PAYMENT_STEP},
    error::{ApiError, ErrorCode},
    protocol::TrustAction,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod adapter;
pub mod countdown;
pub mod session;

pub use adapter::{BackendAdapter, DispatchOutcome, RemoteBackend, SimulatedBackend};
pub use countdown::{countdown_display, IDLE_LABEL, OVERDUE_LABEL};
pub use session::{bootstrap, LaunchContext, TrustSession, DEMO_CASE_ID};

const SYNC_INTERVAL: Duration = Duration::from_secs(5);
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The local transaction was overwritten with an authoritative view.
    StateRefreshed(Transaction),
    /// Exactly one of these two follows every accepted dispatch.
    ActionCompleted { action: &'static str },
    ActionFailed { action: &'static str, error: ApiError },
    CountdownTick { display: String },
    /// The sticky authentication failure; sync stays suspended afterwards.
    SessionInvalidated,
}

/// Outcome of a dispatch attempt as seen by the caller. `Dropped` means the
/// action never ran: another one was in flight, or the client was shut down.
#[derive(Debug)]
pub enum Dispatch {
    Applied,
    Rejected(ApiError),
    Dropped,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub sync_interval: Duration,
    pub countdown_tick: Duration,
    /// Deadline assumed by an optimistically applied contract confirmation
    /// until the authoritative state arrives.
    pub provisional_payment_window: chrono::Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_interval: SYNC_INTERVAL,
            countdown_tick: COUNTDOWN_TICK,
            provisional_payment_window: chrono::Duration::hours(12),
        }
    }
}

struct ClientState {
    tx: Option<Transaction>,
    busy: bool,
    auth_failed: bool,
    closed: bool,
    countdown: String,
}

/// Owns the local view of one case: serializes mutations behind a busy flag,
/// reconciles against the backend, and drives the payment countdown. The
/// sync loop and the dispatch path are the only writers of `tx`.
pub struct TrustRoomClient {
    adapter: Arc<dyn BackendAdapter>,
    case_id: CaseId,
    role: Role,
    config: ClientConfig,
    inner: Mutex<ClientState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl TrustRoomClient {
    pub fn new(adapter: Arc<dyn BackendAdapter>, session: TrustSession) -> Arc<Self> {
        Self::with_config(adapter, session, ClientConfig::default())
    }

    pub fn with_config(
        adapter: Arc<dyn BackendAdapter>,
        session: TrustSession,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            adapter,
            case_id: session.case_id,
            role: session.role,
            config,
            inner: Mutex::new(ClientState {
                tx: None,
                busy: false,
                auth_failed: false,
                closed: false,
                countdown: countdown::IDLE_LABEL.to_string(),
            }),
            tasks: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Option<Transaction> {
        self.inner.lock().await.tx.clone()
    }

    pub async fn countdown(&self) -> String {
        self.inner.lock().await.countdown.clone()
    }

    pub async fn auth_failed(&self) -> bool {
        self.inner.lock().await.auth_failed
    }

    /// Loads the initial state and starts the countdown tick and, for remote
    /// sessions, the synchronization loop. Call once; `shutdown` undoes it.
    pub async fn start(self: &Arc<Self>) {
        self.refresh().await;

        let mut tasks = self.tasks.lock().await;

        let client = Arc::clone(self);
        let tick = self.config.countdown_tick;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                client.countdown_tick().await;
            }
        }));

        // The simulated backend has no server to diverge from; polling it
        // would only re-read our own writes.
        if !self.adapter.is_simulated() {
            let client = Arc::clone(self);
            let every = self.config.sync_interval;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick fires immediately; start() already fetched.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    client.refresh().await;
                }
            }));
        }

        info!(case = %self.case_id, role = %self.role, simulated = self.adapter.is_simulated(), "trust room client started");
    }

    /// Stops both timers and bars any in-flight call from landing later.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.closed = true;
        }
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!(case = %self.case_id, "trust room client shut down");
    }

    /// Re-fetches the authoritative state and overwrites the local view.
    /// Suspended once the sticky authentication failure is set.
    pub async fn refresh(&self) {
        {
            let guard = self.inner.lock().await;
            if guard.closed || guard.auth_failed {
                return;
            }
        }

        match self.adapter.fetch(&self.case_id).await {
            Ok(Some(tx)) => {
                let mut guard = self.inner.lock().await;
                if guard.closed {
                    return;
                }
                guard.tx = Some(tx.clone());
                drop(guard);
                let _ = self.events.send(ClientEvent::StateRefreshed(tx));
            }
            Ok(None) => {
                warn!(case = %self.case_id, "case unknown to the backend");
            }
            Err(err) if err.code == ErrorCode::Unauthorized => {
                let flipped = {
                    let mut guard = self.inner.lock().await;
                    if guard.closed {
                        return;
                    }
                    let flipped = !guard.auth_failed;
                    guard.auth_failed = true;
                    flipped
                };
                if flipped {
                    warn!(case = %self.case_id, "session no longer valid; suspending sync");
                    let _ = self.events.send(ClientEvent::SessionInvalidated);
                }
            }
            Err(err) => {
                warn!(case = %self.case_id, code = %err.code, "refresh failed: {}", err.message);
            }
        }
    }

    /// Runs one action. At most one mutation is in flight per client; a
    /// second dispatch while one is outstanding is dropped, not queued.
    /// Every accepted dispatch emits exactly one completion or failure event.
    ///
    /// The transition is applied optimistically to the local view before the
    /// round-trip; the authoritative state overwrites it on success and the
    /// prior view is restored on rejection.
    pub async fn dispatch(&self, action: TrustAction) -> Dispatch {
        let (previous, applied_optimistically) = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Dispatch::Dropped;
            }
            if guard.busy {
                debug!(action = action.endpoint(), "dispatch dropped: another action is in flight");
                return Dispatch::Dropped;
            }
            guard.busy = true;

            let previous = guard.tx.clone();
            let optimistic = previous.as_ref().and_then(|tx| {
                workflow::apply(
                    tx,
                    &action,
                    self.role,
                    Utc::now(),
                    self.config.provisional_payment_window,
                )
                .ok()
            });
            let applied_optimistically = optimistic.is_some();
            if let Some(next) = optimistic {
                guard.tx = Some(next.clone());
                drop(guard);
                let _ = self.events.send(ClientEvent::StateRefreshed(next));
            }
            (previous, applied_optimistically)
        };

        let outcome = self
            .adapter
            .dispatch(&self.case_id, self.role, &action)
            .await;

        let mut guard = self.inner.lock().await;
        guard.busy = false;
        if guard.closed {
            // Torn down while the call was in flight; the result must not land.
            return Dispatch::Dropped;
        }

        match outcome {
            DispatchOutcome::Applied(tx) => {
                guard.tx = Some(tx.clone());
                drop(guard);
                let _ = self.events.send(ClientEvent::StateRefreshed(tx));
                let _ = self.events.send(ClientEvent::ActionCompleted {
                    action: action.endpoint(),
                });
                Dispatch::Applied
            }
            DispatchOutcome::Rejected(err) => {
                if err.code == ErrorCode::Unauthorized {
                    guard.auth_failed = true;
                }
                if applied_optimistically {
                    guard.tx = previous.clone();
                }
                drop(guard);
                warn!(
                    action = action.endpoint(),
                    code = %err.code,
                    "dispatch rejected: {}",
                    err.message
                );
                if let Some(previous) = previous.filter(|_| applied_optimistically) {
                    let _ = self.events.send(ClientEvent::StateRefreshed(previous));
                }
                let _ = self.events.send(ClientEvent::ActionFailed {
                    action: action.endpoint(),
                    error: err.clone(),
                });
                Dispatch::Rejected(err)
            }
        }
    }

    async fn countdown_tick(&self) {
        let deadline = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return;
            }
            let deadline = guard
                .tx
                .as_ref()
                .and_then(|tx| tx.step(PAYMENT_STEP))
                .filter(|step| step.payment_status == Some(PaymentStatus::Initiated))
                .and_then(|step| step.payment_deadline);
            if deadline.is_none() {
                guard.countdown = countdown::IDLE_LABEL.to_string();
            }
            deadline
        };
        let Some(deadline) = deadline else {
            return;
        };

        let display = countdown_display(deadline, Utc::now());
        let overdue = display == OVERDUE_LABEL;
        {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return;
            }
            guard.countdown = display.clone();
        }
        let _ = self.events.send(ClientEvent::CountdownTick { display });

        if overdue {
            // Expiry is resolved through a fetch on both backends: the
            // simulated fetch flips the state itself, the remote fetch trusts
            // the server to have applied the same rule.
            self.refresh().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
