//! Minimal end-to-end connectivity check.
//!
//! Registers + logs in a test user, creates a room, sends a message,
//! then runs the sync loop and prints incoming text messages.
//!
//! Run from the workspace root against a local homeserver:
//!   cargo run -p tether-core --example connect
//!
//! Env vars (all optional, shown with defaults):
//!   TETHER_HS    http://localhost:8448
//!   TETHER_USER  alice
//!   TETHER_PASS  alicepass
//!   RUST_LOG     tether_core=debug

use std::{env, sync::Arc};

use tether_core::{
    matrix::{
        event_channel, types::CreateRoomRequest, types::MessageContent, ClientConfig,
        ClientEvent, FileSettings, HomeserverClient, RegisterOutcome, SyncController,
        SyncOutcome,
    },
    RetryPolicy,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "tether_core=debug".into()))
        .init();

    let homeserver = env::var("TETHER_HS").unwrap_or_else(|_| "http://localhost:8448".into());
    let username = env::var("TETHER_USER").unwrap_or_else(|_| "alice".into());
    let password = env::var("TETHER_PASS").unwrap_or_else(|_| "alicepass".into());

    let settings = Arc::new(FileSettings::open(format!("/tmp/tether-dev-{username}.json"))?);
    let hs = HomeserverClient::new(ClientConfig::new(&homeserver)?)?;

    info!("server speaks {:?}", hs.versions().await?.versions);

    match hs.register(&username, &password, None).await {
        Ok(RegisterOutcome::Registered(_)) => info!("registered {username}"),
        Ok(RegisterOutcome::FlowRequired(_)) => warn!("registration needs interactive auth"),
        Err(e) => info!("register: {e}"),
    }
    let session = hs.login(&username, &password).await?;
    let client = hs.session(session, settings.clone());

    let room_id = client
        .create_room(&CreateRoomRequest::named("tether connect test"))
        .await?;
    let sent = client
        .send_message(
            &room_id,
            client.next_transaction_id(),
            &MessageContent::text("hello from tether"),
        )
        .await?;
    info!("sent {} to {room_id}", sent.event_id);

    let (tx, mut rx) = event_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let ClientEvent::SyncCompleted(batch) = event {
                for msg in batch.text_messages() {
                    println!("[{}] {}: {}", msg.room_id, msg.sender, msg.body);
                }
            }
        }
    });

    let mut controller = SyncController::new(client, settings, tx);
    let mut backoff = RetryPolicy::default().backoff();

    info!("syncing, Ctrl-C to stop");
    loop {
        let outcome = if controller.next_batch().is_empty() {
            controller.initial_sync().await?
        } else {
            controller.sync().await?
        };

        if let Some(delay) = backoff.after(&outcome) {
            warn!("sync failed, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
        match outcome {
            SyncOutcome::Completed { next_batch } => controller.set_next_batch(next_batch),
            SyncOutcome::Retry { .. } => {}
            SyncOutcome::InvalidToken | SyncOutcome::Discarded => break,
        }
    }
    Ok(())
}
