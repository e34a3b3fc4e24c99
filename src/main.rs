// Local two-peer call: both sides in one process, joined through the
// in-memory store and the loopback network.

use std::sync::Arc;
use std::time::Duration;

use peercall_lib::peer::types::ConnectionState;
use peercall_lib::peer::{LoopbackNetwork, SyntheticMediaDevices};
use peercall_lib::{logger, CallError, MemoryStore, NegotiatorConfig, SessionNegotiator};
use tracing::{error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let config = match NegotiatorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    logger::init(config.logging_enabled);

    if let Err(err) = run(config).await {
        error!(error = %err, "demo call failed");
        std::process::exit(1);
    }
}

async fn run(config: NegotiatorConfig) -> Result<(), CallError> {
    let store = MemoryStore::new();
    let network = LoopbackNetwork::new();
    let devices = SyntheticMediaDevices::new();

    let caller = SessionNegotiator::new(
        config.clone(),
        Arc::new(store.clone()),
        Arc::new(network.clone()),
        Arc::new(devices.clone()),
    )
    .await?;
    let callee = SessionNegotiator::new(
        config,
        Arc::new(store),
        Arc::new(network),
        Arc::new(devices),
    )
    .await?;

    let mut status = caller.events();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            println!("[caller] {event}");
        }
    });

    let id = caller.start_session().await?;
    callee.join_session(id.clone()).await?;

    for side in [&caller, &callee] {
        let mut state = side.subscribe_state();
        let reached = tokio::time::timeout(
            CONNECT_TIMEOUT,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await;
        if !matches!(reached, Ok(Ok(_))) {
            return Err(CallError::TransportFailure(
                "peers did not connect in time".into(),
            ));
        }
    }
    info!(%id, participants = caller.participants(), "call up");

    let mut transcript = callee.subscribe_transcript();
    caller.send_transcript("hello").await;
    if tokio::time::timeout(CONNECT_TIMEOUT, transcript.wait_for(|t| t == "hello"))
        .await
        .is_ok()
    {
        println!("[callee] transcript: {}", callee.transcript());
    }

    caller.set_muted(true);
    caller.hangup().await;
    callee.hangup().await;
    Ok(())
}
