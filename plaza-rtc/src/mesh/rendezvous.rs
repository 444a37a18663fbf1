use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use plaza_core::models::ParticipantId;
use plaza_core::protocol::{ClientMessage, PeerSignal, ServerMessage};

use crate::error::{Result, RtcError};

#[derive(Debug, Clone, PartialEq)]
pub enum RendezvousEvent {
    /// Joined (or re-joined after a reconnect) with a fresh identity
    Welcome {
        self_id: ParticipantId,
        peers: Vec<ParticipantId>,
    },
    PeerJoined(ParticipantId),
    PeerLeft(ParticipantId),
    Signal {
        from: ParticipantId,
        signal: PeerSignal,
    },
    /// The rendezvous is gone for good
    Lost(String),
}

pub type RendezvousEventSender = mpsc::UnboundedSender<RendezvousEvent>;

/// Peer discovery and signal relay keyed by topic
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Join `topic`; returns once the channel is open
    async fn join(&self, topic: &str, events: RendezvousEventSender) -> Result<()>;

    fn signal(&self, to: &ParticipantId, signal: PeerSignal) -> Result<()>;

    async fn leave(&self);
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Rendezvous over the reference service's WebSocket endpoint
///
/// A dropped socket is reopened with exponential backoff and the topic is
/// joined again; every successful re-join produces a new `Welcome`.
pub struct WsRendezvous {
    url: String,
    max_reconnects: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsRendezvous {
    #[must_use]
    pub fn new(url: impl Into<String>, max_reconnects: usize) -> Self {
        Self {
            url: url.into(),
            max_reconnects,
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Rendezvous for WsRendezvous {
    async fn join(&self, topic: &str, events: RendezvousEventSender) -> Result<()> {
        let ws = open_socket(&self.url).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);

        let task = tokio::spawn(supervise(
            self.url.clone(),
            topic.to_string(),
            ws,
            rx,
            events,
            self.cancel.clone(),
            self.max_reconnects,
        ));
        *self.task.lock() = Some(task);

        info!(url = %self.url, "Rendezvous socket open");
        Ok(())
    }

    fn signal(&self, to: &ParticipantId, signal: PeerSignal) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(RtcError::Closed)?;
        tx.send(ClientMessage::Signal {
            to: to.clone(),
            signal,
        })
        .map_err(|_| RtcError::Closed)
    }

    async fn leave(&self) {
        self.cancel.cancel();
        self.outbound.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(LEAVE_TIMEOUT, task).await.is_err() {
                debug!("Rendezvous task did not finish in time");
            }
        }
    }
}

impl Drop for WsRendezvous {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn open_socket(url: &str) -> Result<WsStream> {
    let (ws, _) = connect_async(url).await?;
    Ok(ws)
}

async fn supervise(
    url: String,
    topic: String,
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: RendezvousEventSender,
    cancel: CancellationToken,
    max_reconnects: usize,
) {
    loop {
        match pump(ws, &topic, &mut outbound, &events, &cancel).await {
            Ok(()) => return,
            Err(e) => warn!(url = %url, error = %e, "Rendezvous connection dropped"),
        }
        if cancel.is_cancelled() {
            return;
        }

        match reconnect(&url, max_reconnects, &cancel).await {
            Some(next) => {
                info!(url = %url, "Rendezvous reconnected");
                ws = next;
            }
            None => {
                if !cancel.is_cancelled() {
                    let _ = events.send(RendezvousEvent::Lost(format!(
                        "could not reach {url} after {max_reconnects} attempts"
                    )));
                }
                return;
            }
        }
    }
}

async fn reconnect(url: &str, max_reconnects: usize, cancel: &CancellationToken) -> Option<WsStream> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(max_reconnects)
        .with_jitter()
        .build();

    for (attempt, delay) in backoff.enumerate() {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        match open_socket(url).await {
            Ok(ws) => return Some(ws),
            Err(e) => warn!(attempt = attempt + 1, delay = ?delay, error = %e, "Rendezvous reconnect failed"),
        }
    }
    None
}

/// Run one socket until it closes (error) or the rendezvous is left (Ok)
async fn pump(
    ws: WsStream,
    topic: &str,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &RendezvousEventSender,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();
    send_frame(
        &mut sink,
        &ClientMessage::Join {
            topic: topic.to_string(),
        },
    )
    .await?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = send_frame(&mut sink, &ClientMessage::Leave).await;
                let _ = sink.close().await;
                return Ok(());
            }
            msg = outbound.recv() => match msg {
                Some(msg) => send_frame(&mut sink, &msg).await?,
                None => return Ok(()),
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if let Some(event) = into_event(msg) {
                                if events.send(event).is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed rendezvous frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RtcError::Signaling("rendezvous closed the connection".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

fn into_event(msg: ServerMessage) -> Option<RendezvousEvent> {
    match msg {
        ServerMessage::Welcome { self_id, peers } => Some(RendezvousEvent::Welcome { self_id, peers }),
        ServerMessage::PeerJoined { peer_id } => Some(RendezvousEvent::PeerJoined(peer_id)),
        ServerMessage::PeerLeft { peer_id } => Some(RendezvousEvent::PeerLeft(peer_id)),
        ServerMessage::Signal { from, signal } => Some(RendezvousEvent::Signal { from, signal }),
        ServerMessage::Error { message } => {
            warn!(message = %message, "Rendezvous reported an error");
            None
        }
    }
}

async fn send_frame<S>(sink: &mut S, msg: &impl Serialize) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
