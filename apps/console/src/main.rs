use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    bootstrap, BackendAdapter, ClientEvent, LaunchContext, RemoteBackend, SimulatedBackend,
    TrustRoomClient,
};
use shared::{
    domain::{CaseId, Role, StepData},
    protocol::TrustAction,
};
use storage::TrustStore;

#[derive(Parser, Debug)]
struct Args {
    /// Run against the in-process simulated backend instead of a server.
    #[arg(long)]
    simulate: bool,
    #[arg(long)]
    server_url: Option<String>,
    /// One-time exchange token taken from a shared case link.
    #[arg(long)]
    exchange_token: Option<String>,
    #[arg(long)]
    case_id: Option<String>,
    /// "agent" or "buyer"; only meaningful for simulated sessions.
    #[arg(long)]
    role: Option<String>,
    #[arg(long, default_value = "./data/simulated.db")]
    store_path: String,
    /// In simulated mode, walk the first step once before listening.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let role = match args.role.as_deref() {
        Some("agent") => Some(Role::Agent),
        Some("buyer") => Some(Role::Buyer),
        Some(other) => anyhow::bail!("unknown role '{other}' (expected agent or buyer)"),
        None => None,
    };

    let mut remote = match (&args.server_url, args.simulate) {
        (Some(url), false) => Some(RemoteBackend::new(url)?),
        _ => None,
    };

    let launch = LaunchContext {
        simulate: args.simulate || args.server_url.is_none(),
        case_id: args.case_id.map(CaseId::new),
        role,
        exchange_token: args.exchange_token,
    };

    let Some(session) = bootstrap(launch, remote.as_ref())
        .await
        .map_err(|err| anyhow::anyhow!("{}: {}", err.code, err.message))?
    else {
        println!("no active case for this viewer");
        return Ok(());
    };

    let adapter: Arc<dyn BackendAdapter> = if session.simulated {
        let store = TrustStore::new(&format!("sqlite://{}", args.store_path)).await?;
        Arc::new(SimulatedBackend::new(store))
    } else {
        Arc::new(remote.take().context("remote session without a server url")?)
    };

    println!(
        "case {} as {} ({})",
        session.case_id,
        session.role,
        if session.simulated { "simulated" } else { "remote" }
    );

    let client = TrustRoomClient::new(adapter, session.clone());
    let mut events = client.subscribe_events();
    client.start().await;

    if args.demo && session.simulated {
        client
            .dispatch(TrustAction::Submit {
                step: 1,
                data: StepData {
                    note: Some("first call made".into()),
                    ..StepData::default()
                },
            })
            .await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::StateRefreshed(tx)) => {
                    println!(
                        "state: step {}/{}{}",
                        tx.current_step,
                        shared::domain::LAST_STEP,
                        if tx.is_paid { " (paid)" } else { "" }
                    );
                }
                Ok(ClientEvent::ActionCompleted { action }) => println!("ok: {action}"),
                Ok(ClientEvent::ActionFailed { action, error }) => {
                    println!("failed: {action}: {} ({})", error.message, error.code);
                }
                Ok(ClientEvent::CountdownTick { display }) => println!("payment window: {display}"),
                Ok(ClientEvent::SessionInvalidated) => println!("session expired; open a fresh link"),
                Err(_) => break,
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
