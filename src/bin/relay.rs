#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::sync::{Arc, Mutex};

#[cfg(not(target_arch = "wasm32"))]
use clap::Parser;
#[cfg(not(target_arch = "wasm32"))]
use futures::{SinkExt, StreamExt};
#[cfg(not(target_arch = "wasm32"))]
use tokio::net::{TcpListener, TcpStream};
#[cfg(not(target_arch = "wasm32"))]
use tokio::sync::broadcast;
#[cfg(not(target_arch = "wasm32"))]
use tokio_tungstenite::{accept_async, tungstenite::Message};
#[cfg(not(target_arch = "wasm32"))]
use tracing::{info, warn};

#[cfg(not(target_arch = "wasm32"))]
use webtris::{RawClientMessage, Roster, ServerMessage};

/// Roster relay: tracks connected players and pushes everyone's
/// name/score/alive to every session.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Parser, Debug)]
struct Opts {
    /// Address to listen for websocket connections (browser connects here)
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: String,
}

#[cfg(not(target_arch = "wasm32"))]
struct Shared {
    roster: Mutex<Roster>,
    updates: broadcast::Sender<String>,
}

#[cfg(not(target_arch = "wasm32"))]
impl Shared {
    /// Snapshot the roster and fan it out to every connection task.
    fn broadcast_roster(&self) {
        let players = self.roster.lock().expect("roster lock").snapshot();
        if let Ok(text) = serde_json::to_string(&ServerMessage::Roster { players }) {
            let _ = self.updates.send(text);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let opts = Opts::parse();
    let listener = TcpListener::bind(&opts.listen).await?;
    info!("roster relay listening on ws://{}", opts.listen);

    let (updates, _) = broadcast::channel(64);
    let shared = Arc::new(Shared {
        roster: Mutex::new(Roster::new()),
        updates,
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, shared).await {
                warn!("connection error {addr}: {e:?}");
            }
        });
    }
}

#[cfg(not(target_arch = "wasm32"))]
async fn handle_conn(stream: TcpStream, shared: Arc<Shared>) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Join handshake: the session is not on the roster until it asks to be.
    let joined = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Ok(RawClientMessage::Join { name }) = serde_json::from_str(&text) {
                    let requested = name.as_ref().and_then(serde_json::Value::as_str);
                    break shared.roster.lock().expect("roster lock").join(requested);
                }
                // Anything else before the handshake is dropped.
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    let id = joined.id;
    info!("player joined: {} (#{id})", joined.name);

    // Subscribe before announcing the join so this session cannot miss the
    // snapshot triggered by its own arrival.
    let mut updates = shared.updates.subscribe();
    let welcome = {
        let roster = shared.roster.lock().expect("roster lock");
        ServerMessage::Welcome {
            id,
            name: joined.name.clone(),
            players: roster.snapshot(),
        }
    };
    ws_tx.send(Message::Text(serde_json::to_string(&welcome)?)).await?;
    shared.broadcast_roster();

    let result = async {
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(text) => ws_tx.send(Message::Text(text)).await?,
                    // A lagged receiver only missed snapshots that the next
                    // one supersedes.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str(&text) {
                            Ok(RawClientMessage::State { score, alive }) => {
                                let changed = shared
                                    .roster
                                    .lock()
                                    .expect("roster lock")
                                    .apply(id, score.as_ref(), alive.as_ref());
                                if changed {
                                    shared.broadcast_roster();
                                }
                            }
                            // Unknown or malformed frames are ignored.
                            Ok(_) | Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(entry) = shared.roster.lock().expect("roster lock").remove(id) {
        info!("player left: {} (#{id})", entry.name);
    }
    shared.broadcast_roster();
    result
}
