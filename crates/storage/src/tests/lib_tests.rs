use super::*;
use chrono::Duration;
use shared::domain::AgentStatus;
use tempfile::TempDir;

async fn temp_store() -> (TempDir, TrustStore) {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("trust.db").display());
    let store = TrustStore::new(&url).await.expect("store");
    (dir, store)
}

#[tokio::test]
async fn unknown_case_loads_as_none() {
    let (_dir, store) = temp_store().await;
    let loaded = store.load_case(&CaseId::from("missing")).await.expect("load");
    assert!(loaded.is_none());
}

#[tokio::test]
async fn save_then_load_roundtrips_case_state() {
    let (_dir, store) = temp_store().await;
    let mut tx = Transaction::initial(CaseId::from("T-1"));
    tx.step_mut(1).unwrap().agent_status = AgentStatus::Submitted;
    tx.step_mut(1).unwrap().data.note = Some("called".into());

    store.save_case(&tx).await.expect("save");
    let loaded = store
        .load_case(&CaseId::from("T-1"))
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded, tx);
}

#[tokio::test]
async fn load_or_create_persists_the_initial_state_once() {
    let (_dir, store) = temp_store().await;
    let id = CaseId::from("T-2");

    let created = store.load_or_create(&id).await.expect("create");
    assert_eq!(created, Transaction::initial(id.clone()));

    let mut mutated = created.clone();
    mutated.step_mut(1).unwrap().locked = true;
    store.save_case(&mutated).await.expect("save");

    // A second load_or_create must return the stored state, not a fresh one.
    let reloaded = store.load_or_create(&id).await.expect("reload");
    assert_eq!(reloaded, mutated);
}

#[tokio::test]
async fn save_case_overwrites_in_place() {
    let (_dir, store) = temp_store().await;
    let id = CaseId::from("T-3");
    let first = store.load_or_create(&id).await.expect("create");

    let mut second = first.clone();
    second.is_paid = true;
    store.save_case(&second).await.expect("save");

    let loaded = store.load_case(&id).await.expect("load").expect("present");
    assert!(loaded.is_paid);
}

#[tokio::test]
async fn exchange_token_is_single_use() {
    let (_dir, store) = temp_store().await;
    let id = CaseId::from("T-4");
    let now = Utc::now();

    store
        .insert_exchange_token("tok-1", &id, Role::Buyer, now + Duration::hours(12))
        .await
        .expect("insert");

    let grant = store
        .consume_exchange_token("tok-1", now)
        .await
        .expect("consume")
        .expect("granted");
    assert_eq!(grant, (id.clone(), Role::Buyer));

    let second = store
        .consume_exchange_token("tok-1", now)
        .await
        .expect("consume");
    assert!(second.is_none());
}

#[tokio::test]
async fn expired_or_unknown_exchange_tokens_are_rejected() {
    let (_dir, store) = temp_store().await;
    let id = CaseId::from("T-5");
    let now = Utc::now();

    store
        .insert_exchange_token("tok-stale", &id, Role::Agent, now - Duration::minutes(1))
        .await
        .expect("insert");

    assert!(store
        .consume_exchange_token("tok-stale", now)
        .await
        .expect("consume")
        .is_none());
    assert!(store
        .consume_exchange_token("tok-never-issued", now)
        .await
        .expect("consume")
        .is_none());
}
