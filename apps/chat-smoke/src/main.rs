mod config;
mod logging;

use std::{process, sync::Arc};

use chat_core::ChatEvent;
use chat_platform::{FileKeyValueStore, KeyValueStore};
use chat_ws::{RuntimeDeps, StaticIdentity, spawn_runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };

    let storage: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(&config.data_dir));
    let identity = Arc::new(StaticIdentity::new(config.user.clone()));
    let deps = match RuntimeDeps::networked(&config.endpoints, storage, identity) {
        Ok(deps) => deps,
        Err(err) => {
            eprintln!("Failed to initialize chat clients: {err}");
            process::exit(1);
        }
    };

    info!(
        ws_url = %config.endpoints.ws_url,
        api_base = %config.endpoints.api_base,
        data_dir = %config.data_dir.display(),
        room = config.room,
        "starting chat smoke run"
    );
    let handle = spawn_runtime(config.runtime.clone(), deps);
    let mut events = handle.subscribe();

    let setup = async {
        handle.list_rooms().await?;
        handle.join_room(config.room.clone()).await?;
        handle.open().await?;
        handle
            .send_message(config.room.clone(), "smoke check", Vec::new())
            .await
    };
    match setup.await {
        Ok(message_id) => info!(message_id, "smoke message submitted"),
        Err(err) => {
            error!(error = %err, "runtime rejected setup commands");
            process::exit(1);
        }
    }
    println!("Chat runtime started. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Err(err) = handle.close().await {
        warn!(error = %err, "close command not delivered");
    }
    info!("chat smoke run finished");
}

fn report(event: &ChatEvent) {
    match event {
        ChatEvent::ConnectionFailed { error }
        | ChatEvent::SyncFailed { error }
        | ChatEvent::PersistenceFailed { error }
        | ChatEvent::CommandFailed { error } => {
            warn!(code = error.code, detail = error.message, "{event:?}")
        }
        ChatEvent::ReconnectExhausted { attempts, error } => {
            error!(attempts, code = error.code, "reconnect attempts exhausted; restart to retry")
        }
        ChatEvent::RoomsListed { rooms } => info!(count = rooms.len(), "room directory loaded"),
        other => info!(event = ?other, "chat event"),
    }
}
