//! The membership actor. One task owns every structural change to the
//! broadcaster's map; callers talk to it over bounded channels.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::OutboundQueue;

use super::broadcast::{Broadcaster, ClientHandle};

pub(crate) enum Register {
    Client {
        client: Arc<ClientHandle>,
        /// Receives the superseded client, if any.
        ack: oneshot::Sender<Option<Arc<ClientHandle>>>,
    },
    LobbyWatcher {
        id: u64,
        queue: Arc<OutboundQueue>,
        ack: oneshot::Sender<()>,
    },
}

pub(crate) enum Unregister {
    Client {
        game_id: String,
        player_id: String,
        session_id: String,
        /// Receives the removed client, or `None` if it was already gone
        /// or superseded.
        ack: oneshot::Sender<Option<Arc<ClientHandle>>>,
    },
    LobbyWatcher {
        id: u64,
    },
}

pub(crate) struct DispatchChannels {
    pub register: mpsc::Sender<Register>,
    pub unregister: mpsc::Sender<Unregister>,
}

/// Spawn the dispatch loop. It exits when `shutdown` fires or every sender
/// is dropped, closing all remaining client queues.
pub(crate) fn spawn_dispatch(
    broadcaster: Arc<Broadcaster>,
    capacity: usize,
    shutdown: CancellationToken,
) -> (DispatchChannels, JoinHandle<()>) {
    let (register_tx, register_rx) = mpsc::channel(capacity);
    let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_dispatch(broadcaster, register_rx, unregister_rx, shutdown));
    (
        DispatchChannels {
            register: register_tx,
            unregister: unregister_tx,
        },
        handle,
    )
}

async fn run_dispatch(
    broadcaster: Arc<Broadcaster>,
    mut register_rx: mpsc::Receiver<Register>,
    mut unregister_rx: mpsc::Receiver<Unregister>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(req) = unregister_rx.recv() => handle_unregister(&broadcaster, req),
            Some(req) = register_rx.recv() => handle_register(&broadcaster, req),
            else => break,
        }
    }
    broadcaster.close_all();
    tracing::info!("Hub dispatch loop stopped");
}

fn handle_register(broadcaster: &Broadcaster, req: Register) {
    match req {
        Register::Client { client, ack } => {
            let game_id = client.game_id.clone();
            let player_id = client.player_id.clone();
            let session_id = client.session_id.clone();
            let previous = broadcaster.insert(client);
            if let Some(prev) = &previous {
                tracing::info!(
                    %game_id,
                    %player_id,
                    old_session = %prev.session_id,
                    new_session = %session_id,
                    "Superseded live client"
                );
            } else {
                tracing::debug!(%game_id, %player_id, %session_id, "Client registered");
            }
            let _ = ack.send(previous);
        },
        Register::LobbyWatcher { id, queue, ack } => {
            broadcaster.add_lobby_watcher(id, queue);
            let _ = ack.send(());
        },
    }
}

fn handle_unregister(broadcaster: &Broadcaster, req: Unregister) {
    match req {
        Unregister::Client {
            game_id,
            player_id,
            session_id,
            ack,
        } => {
            let removed = broadcaster.remove(&game_id, &player_id, &session_id);
            if removed.is_some() {
                tracing::debug!(%game_id, %player_id, %session_id, "Client unregistered");
            }
            let _ = ack.send(removed);
        },
        Unregister::LobbyWatcher { id } => {
            broadcaster.remove_lobby_watcher(id);
        },
    }
}
