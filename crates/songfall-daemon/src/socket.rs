use std::sync::Arc;

use songfall_proto::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use songfall_proto::state::StateManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::core::DaemonEvent;
use crate::BroadcastMessage;

/// Length-prefixed JSON over TCP.  Each client gets `Hello` on connect, a
/// fresh `State` after each of its commands, and every broadcast.
pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };
        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    let bcast_rx = broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                let n = match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                };
                read_buf.extend_from_slice(&tmp[..n]);

                // Drain every complete frame; a partial one waits for more bytes.
                loop {
                    let (msg, consumed) = match Message::decode(&read_buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Dropping client {}: bad frame: {}", client_id, e);
                            return;
                        }
                    };
                    read_buf.drain(..consumed);
                    let Message::Command(cmd) = msg else {
                        continue;
                    };
                    info!("Client {} sent command: {:?}", client_id, cmd);
                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                        warn!("DaemonEvent channel closed");
                        return;
                    }
                    if let Ok(encoded) = encode_state(&state_manager).await {
                        if write_half.write_all(&encoded).await.is_err() {
                            return;
                        }
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Ok(BroadcastMessage::Error(message)) => {
                        Message::Broadcast(Broadcast::Error { message }).encode()
                    }
                    Ok(BroadcastMessage::Exhausted { song_id, attempts }) => {
                        Message::Broadcast(Broadcast::Exhausted { song_id, attempts }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: state.rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}
