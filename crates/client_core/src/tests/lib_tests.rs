use super::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use shared::domain::StepData;
use tempfile::TempDir;
use tokio::time::timeout;

fn demo_session(case: &str, role: Role) -> TrustSession {
    TrustSession {
        case_id: CaseId::from(case),
        role,
        simulated: true,
    }
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        sync_interval: Duration::from_millis(20),
        countdown_tick: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

async fn sim_adapter() -> (TempDir, Arc<SimulatedBackend>) {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("client.db").display());
    let store = storage::TrustStore::new(&url).await.expect("store");
    let backend = SimulatedBackend::new(store).with_latency(Duration::ZERO);
    (dir, Arc::new(backend))
}

fn submit_step_one() -> TrustAction {
    TrustAction::Submit {
        step: 1,
        data: StepData {
            note: Some("called".into()),
            ..StepData::default()
        },
    }
}

/// Scripted backend for controller-level tests.
struct TestBackend {
    fetch_calls: AtomicUsize,
    dispatch_calls: AtomicUsize,
    dispatch_delay: Duration,
    fetch_error: Option<ApiError>,
    state: Transaction,
}

impl TestBackend {
    fn healthy(case: &str) -> Self {
        Self {
            fetch_calls: AtomicUsize::new(0),
            dispatch_calls: AtomicUsize::new(0),
            dispatch_delay: Duration::ZERO,
            fetch_error: None,
            state: Transaction::initial(CaseId::from(case)),
        }
    }

    fn locked_out(case: &str) -> Self {
        Self {
            fetch_error: Some(ApiError::unauthorized("session expired")),
            ..Self::healthy(case)
        }
    }

    fn slow(case: &str, delay: Duration) -> Self {
        Self {
            dispatch_delay: delay,
            ..Self::healthy(case)
        }
    }
}

#[async_trait]
impl BackendAdapter for TestBackend {
    async fn fetch(&self, _case_id: &CaseId) -> Result<Option<Transaction>, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fetch_error {
            return Err(err.clone());
        }
        Ok(Some(self.state.clone()))
    }

    async fn dispatch(
        &self,
        _case_id: &CaseId,
        _role: Role,
        _action: &TrustAction,
    ) -> DispatchOutcome {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.dispatch_delay).await;
        DispatchOutcome::Applied(self.state.clone())
    }
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event before timeout")
        .expect("channel open")
}

#[tokio::test]
async fn dispatch_emits_exactly_one_completion_and_updates_state() {
    let (_dir, adapter) = sim_adapter().await;
    let client = TrustRoomClient::new(adapter, demo_session("T-1", Role::Agent));
    let mut events = client.subscribe_events();

    let outcome = client.dispatch(submit_step_one()).await;
    assert!(matches!(outcome, Dispatch::Applied));

    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::StateRefreshed(_)
    ));
    match next_event(&mut events).await {
        ClientEvent::ActionCompleted { action } => assert_eq!(action, "submit"),
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    let snapshot = client.snapshot().await.expect("state");
    assert_eq!(
        snapshot.step(1).unwrap().data.note.as_deref(),
        Some("called")
    );
}

#[tokio::test]
async fn rejected_dispatch_emits_one_failure_and_releases_the_busy_flag() {
    let (_dir, adapter) = sim_adapter().await;
    let client = TrustRoomClient::new(adapter, demo_session("T-1", Role::Buyer));
    let mut events = client.subscribe_events();

    // Confirm before the agent submitted: a machine rejection.
    let outcome = client
        .dispatch(TrustAction::Confirm { step: 1, note: None })
        .await;
    match outcome {
        Dispatch::Rejected(err) => assert_eq!(err.code, ErrorCode::InvalidState),
        other => panic!("expected rejection, got {other:?}"),
    }
    match next_event(&mut events).await {
        ClientEvent::ActionFailed { action, error } => {
            assert_eq!(action, "confirm");
            assert_eq!(error.code, ErrorCode::InvalidState);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    // The flag released: the next action goes through.
    let outcome = client
        .dispatch(TrustAction::Supplement {
            content: "for the record".into(),
        })
        .await;
    assert!(matches!(outcome, Dispatch::Applied));
}

/// Rejects every dispatch; fetch always answers with the seeded state.
struct RejectingBackend {
    state: Transaction,
}

#[async_trait]
impl BackendAdapter for RejectingBackend {
    async fn fetch(&self, _case_id: &CaseId) -> Result<Option<Transaction>, ApiError> {
        Ok(Some(self.state.clone()))
    }

    async fn dispatch(
        &self,
        _case_id: &CaseId,
        _role: Role,
        _action: &TrustAction,
    ) -> DispatchOutcome {
        DispatchOutcome::Rejected(ApiError::invalid_state("server said no"))
    }
}

#[tokio::test]
async fn optimistic_mutation_is_rolled_back_on_rejection() {
    let adapter = Arc::new(RejectingBackend {
        state: Transaction::initial(CaseId::from("T-1")),
    });
    let client = TrustRoomClient::new(
        adapter as Arc<dyn BackendAdapter>,
        TrustSession {
            case_id: CaseId::from("T-1"),
            role: Role::Agent,
            simulated: false,
        },
    );
    client.refresh().await;
    let before = client.snapshot().await.expect("state");
    let mut events = client.subscribe_events();

    let outcome = client.dispatch(submit_step_one()).await;
    assert!(matches!(outcome, Dispatch::Rejected(_)));

    // Optimistic view first, then the rollback, then the one failure event.
    match next_event(&mut events).await {
        ClientEvent::StateRefreshed(tx) => assert_eq!(
            tx.step(1).unwrap().agent_status,
            shared::domain::AgentStatus::Submitted
        ),
        other => panic!("expected optimistic state, got {other:?}"),
    }
    match next_event(&mut events).await {
        ClientEvent::StateRefreshed(tx) => assert_eq!(tx, before),
        other => panic!("expected rollback, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::ActionFailed { .. }
    ));

    assert_eq!(client.snapshot().await.expect("state"), before);
}

#[tokio::test]
async fn a_second_dispatch_while_one_is_in_flight_is_dropped() {
    let adapter = Arc::new(TestBackend::slow("T-1", Duration::from_millis(150)));
    let client = TrustRoomClient::new(
        adapter.clone() as Arc<dyn BackendAdapter>,
        demo_session("T-1", Role::Agent),
    );

    let racing = Arc::clone(&client);
    let first = tokio::spawn(async move { racing.dispatch(submit_step_one()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = client.dispatch(submit_step_one()).await;
    assert!(matches!(second, Dispatch::Dropped));

    let first = first.await.expect("join");
    assert!(matches!(first, Dispatch::Applied));
    assert_eq!(adapter.dispatch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unauthorized_fetch_is_sticky_and_suspends_the_sync_loop() {
    let adapter = Arc::new(TestBackend::locked_out("T-1"));
    let client = TrustRoomClient::with_config(
        adapter.clone() as Arc<dyn BackendAdapter>,
        TrustSession {
            case_id: CaseId::from("T-1"),
            role: Role::Buyer,
            simulated: false,
        },
        fast_config(),
    );
    let mut events = client.subscribe_events();

    client.start().await;
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::SessionInvalidated
    ));
    assert!(client.auth_failed().await);

    // Give the sync loop several intervals; it must not fetch again.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn the_sync_loop_reconciles_remote_state() {
    let adapter = Arc::new(TestBackend::healthy("T-1"));
    let client = TrustRoomClient::with_config(
        adapter.clone() as Arc<dyn BackendAdapter>,
        TrustSession {
            case_id: CaseId::from("T-1"),
            role: Role::Buyer,
            simulated: false,
        },
        fast_config(),
    );

    client.start().await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    client.shutdown().await;

    // Initial refresh plus periodic re-fetches.
    assert!(adapter.fetch_calls.load(Ordering::SeqCst) >= 3);
    assert!(client.snapshot().await.is_some());
}

#[tokio::test]
async fn simulated_sessions_do_not_poll() {
    let (_dir, adapter) = sim_adapter().await;
    let client = TrustRoomClient::with_config(
        adapter,
        demo_session("T-1", Role::Agent),
        fast_config(),
    );
    client.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Only the countdown task runs; state came from the initial refresh.
    assert!(client.snapshot().await.is_some());
    assert_eq!(client.countdown().await, IDLE_LABEL);
    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_blocks_late_dispatch_results() {
    let adapter = Arc::new(TestBackend::slow("T-1", Duration::from_millis(150)));
    let client = TrustRoomClient::new(
        adapter as Arc<dyn BackendAdapter>,
        demo_session("T-1", Role::Agent),
    );
    let mut events = client.subscribe_events();

    let racing = Arc::clone(&client);
    let in_flight = tokio::spawn(async move { racing.dispatch(submit_step_one()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.shutdown().await;

    let outcome = in_flight.await.expect("join");
    assert!(matches!(outcome, Dispatch::Dropped));
    assert!(client.snapshot().await.is_none());
    assert!(events.try_recv().is_err());

    // Dispatching after teardown never reaches the adapter.
    let outcome = client.dispatch(submit_step_one()).await;
    assert!(matches!(outcome, Dispatch::Dropped));
}

#[tokio::test]
async fn the_countdown_runs_the_window_down_to_expiry() {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("countdown.db").display());
    let store = storage::TrustStore::new(&url).await.expect("store");
    let adapter = Arc::new(
        SimulatedBackend::new(store)
            .with_latency(Duration::ZERO)
            .with_payment_window(chrono::Duration::milliseconds(200)),
    );
    let client = TrustRoomClient::with_config(
        adapter.clone() as Arc<dyn BackendAdapter>,
        demo_session("T-cd", Role::Buyer),
        fast_config(),
    );
    let case = CaseId::from("T-cd");

    // Walk the case to an initiated payment window.
    for step in 1..shared::domain::PAYMENT_STEP {
        adapter
            .dispatch(
                &case,
                Role::Agent,
                &TrustAction::Submit {
                    step,
                    data: StepData::default(),
                },
            )
            .await;
        adapter
            .dispatch(&case, Role::Buyer, &TrustAction::Confirm { step, note: None })
            .await;
    }
    adapter
        .dispatch(
            &case,
            Role::Agent,
            &TrustAction::Submit {
                step: shared::domain::PAYMENT_STEP,
                data: StepData::default(),
            },
        )
        .await;
    adapter
        .dispatch(
            &case,
            Role::Buyer,
            &TrustAction::Confirm {
                step: shared::domain::PAYMENT_STEP,
                note: None,
            },
        )
        .await;

    let mut events = client.subscribe_events();
    client.start().await;

    let mut saw_running_countdown = false;
    let mut saw_overdue = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(ClientEvent::CountdownTick { display })) => {
                if display == OVERDUE_LABEL {
                    saw_overdue = true;
                    break;
                }
                saw_running_countdown = true;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_running_countdown, "countdown never ticked");
    assert!(saw_overdue, "countdown never reached the overdue label");

    // The overdue tick triggered a refresh; the simulated fetch flipped the
    // window to expired.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let snapshot = client.snapshot().await.expect("state");
    assert_eq!(
        snapshot
            .step(shared::domain::PAYMENT_STEP)
            .unwrap()
            .payment_status,
        Some(shared::domain::PaymentStatus::Expired)
    );

    client.shutdown().await;
}
