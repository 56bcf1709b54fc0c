use super::*;
use shared::domain::{AgentStatus, PaymentStatus, StepData, PAYMENT_STEP};
use tempfile::TempDir;

async fn temp_ctx() -> (TempDir, ApiContext) {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("trust.db").display());
    let store = TrustStore::new(&url).await.expect("store");
    (
        dir,
        ApiContext {
            store,
            payment_window: Duration::hours(12),
            token_ttl: Duration::hours(12),
        },
    )
}

#[tokio::test]
async fn status_of_an_unknown_case_is_not_found() {
    let (_dir, ctx) = temp_ctx().await;
    let err = status(&ctx, &CaseId::from("nope")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn status_applies_lazy_expiry_and_persists_it() {
    let (_dir, ctx) = temp_ctx().await;
    let case_id = CaseId::from("T-exp");
    let mut tx = Transaction::initial(case_id.clone());
    let contract = tx.step_mut(PAYMENT_STEP).unwrap();
    contract.payment_status = Some(PaymentStatus::Initiated);
    contract.payment_deadline = Some(Utc::now() - Duration::minutes(1));
    ctx.store.save_case(&tx).await.expect("save");

    let seen = status(&ctx, &case_id).await.expect("status");
    assert_eq!(
        seen.step(PAYMENT_STEP).unwrap().payment_status,
        Some(PaymentStatus::Expired)
    );

    let stored = ctx
        .store
        .load_case(&case_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(
        stored.step(PAYMENT_STEP).unwrap().payment_status,
        Some(PaymentStatus::Expired)
    );
}

#[tokio::test]
async fn submit_and_confirm_walk_the_first_step() {
    let (_dir, ctx) = temp_ctx().await;
    let case_id = CaseId::from("T-1");
    ctx.store.load_or_create(&case_id).await.expect("create");

    let body = ActionBody {
        step: Some(1),
        data: Some(StepData {
            note: Some("called".into()),
            ..StepData::default()
        }),
        ..ActionBody::default()
    };
    let tx = dispatch_action(&ctx, "submit", &case_id, Role::Agent, body)
        .await
        .expect("submit");
    assert_eq!(tx.step(1).unwrap().agent_status, AgentStatus::Submitted);
    assert_eq!(tx.step(1).unwrap().data.note.as_deref(), Some("called"));

    // The body may omit `step`; the case's current step is assumed.
    let tx = dispatch_action(&ctx, "confirm", &case_id, Role::Buyer, ActionBody::default())
        .await
        .expect("confirm");
    assert!(tx.step(1).unwrap().locked);
    assert_eq!(tx.current_step, 2);
}

#[tokio::test]
async fn the_session_role_gates_actions() {
    let (_dir, ctx) = temp_ctx().await;
    let case_id = CaseId::from("T-role");
    ctx.store.load_or_create(&case_id).await.expect("create");

    let body = ActionBody {
        step: Some(1),
        ..ActionBody::default()
    };
    let err = dispatch_action(&ctx, "submit", &case_id, Role::Buyer, body)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    let stored = ctx
        .store
        .load_case(&case_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored, Transaction::initial(case_id));
}

#[tokio::test]
async fn malformed_action_bodies_are_rejected() {
    let (_dir, ctx) = temp_ctx().await;
    let case_id = CaseId::from("T-bad");
    ctx.store.load_or_create(&case_id).await.expect("create");

    // checklist without itemId/checked cannot be decoded into an action
    let err = dispatch_action(&ctx, "checklist", &case_id, Role::Buyer, ActionBody::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
}

#[tokio::test]
async fn created_cases_mint_single_use_entry_tokens() {
    let (_dir, ctx) = temp_ctx().await;
    let created = create_case(&ctx, Some("T-sys".into())).await.expect("create");
    assert_eq!(created.case_id, CaseId::from("T-sys"));

    let profile = exchange_session(&ctx, &created.agent_token)
        .await
        .expect("exchange");
    assert_eq!(profile.case_id, CaseId::from("T-sys"));
    assert_eq!(profile.role, Role::Agent);

    // Single use: the same token is dead afterwards.
    let err = exchange_session(&ctx, &created.agent_token)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);

    let profile = exchange_session(&ctx, &created.buyer_token)
        .await
        .expect("exchange");
    assert_eq!(profile.role, Role::Buyer);
}

#[tokio::test]
async fn creating_the_same_case_twice_is_invalid() {
    let (_dir, ctx) = temp_ctx().await;
    create_case(&ctx, Some("T-dup".into())).await.expect("create");
    let err = create_case(&ctx, Some("T-dup".into())).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
}

#[test]
fn payment_limiter_throttles_per_case() {
    let limiter = PaymentLimiter::default();
    let case_a = CaseId::from("A");
    let case_b = CaseId::from("B");
    let now = Utc::now();

    for _ in 0..PAYMENT_ATTEMPT_MAX {
        assert!(limiter.allow(&case_a, now));
    }
    assert!(!limiter.allow(&case_a, now));
    // Other cases have their own budget.
    assert!(limiter.allow(&case_b, now));
    // Attempts age out of the window.
    assert!(limiter.allow(&case_a, now + Duration::seconds(PAYMENT_ATTEMPT_WINDOW_SECS + 1)));
}
