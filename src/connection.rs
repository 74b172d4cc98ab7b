//! The streaming channel: one task per WebSocket connection.
//!
//! [`drive_connection`] is transport independent. It consumes inbound
//! [`ClientFrame`]s, drives the connection's [`InferenceSession`] and pushes
//! [`Response`]s, in order, into an outbound channel. The WebSocket adapter
//! in [`serve_socket`] only translates frames.
//!
//! [`InferenceSession`]: crate::session::InferenceSession

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, Stream, StreamExt, stream::BoxStream};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    encoder::{self, SessionMode},
    error::ServiceError,
    params::ValidationError,
    protocol::{ClientMessage, Reply, Response},
    server::AppState,
    session::{SessionLease, SessionState},
};

/// Outbound replies buffered per connection.
const OUTBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
}

type ReplyStream = BoxStream<'static, Result<Reply, ServiceError>>;

/// Text and token count streamed so far in the running cycle.
#[derive(Default)]
struct CycleProgress {
    outputs: String,
    token_count: usize,
}

struct Connection {
    state: AppState,
    lease: SessionLease,
    outbound: mpsc::Sender<Response>,
    cycle: Option<ReplyStream>,
    progress: CycleProgress,
    idle_deadline: Instant,
}

/// Runs the session protocol until the inbound stream ends, the outbound
/// side goes away, the connection is released, or the connection idles out
/// while waiting for an open or generate message.
pub async fn drive_connection<S>(state: AppState, inbound: S, outbound: mpsc::Sender<Response>)
where
    S: Stream<Item = ClientFrame> + Unpin,
{
    let lease = state.sessions.register();
    let cancel = lease.cancellation_token();
    let idle_deadline = Instant::now() + state.config.session_idle_timeout;
    let mut inbound = inbound;
    let mut conn = Connection {
        state,
        lease,
        outbound,
        cycle: None,
        progress: CycleProgress::default(),
        idle_deadline,
    };
    let connection_id = conn.lease.connection_id();
    debug!(connection_id, "connection accepted");

    loop {
        let session_state = conn.session_state();
        let idle_armed = conn.cycle.is_none()
            && matches!(session_state, SessionState::Uninitialized | SessionState::Open);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(connection_id, "connection released");
                break;
            }
            frame = inbound.next() => {
                let Some(frame) = frame else {
                    debug!(connection_id, "client disconnected");
                    break;
                };
                if !conn.handle_frame(frame).await {
                    break;
                }
            }
            item = next_reply(&mut conn.cycle), if conn.cycle.is_some() => {
                if !conn.forward(item).await {
                    break;
                }
            }
            _ = sleep_until(conn.idle_deadline), if idle_armed => {
                let timeout = conn.state.config.session_idle_timeout;
                info!(connection_id, ?timeout, ?session_state, "closing idle inference session");
                conn.lease.session().close();
                let awaited = match session_state {
                    SessionState::Uninitialized => "an open_inference_session",
                    _ => "a generate",
                };
                let err = ServiceError::protocol(format!(
                    "inference session closed after {}s without {awaited} message",
                    timeout.as_secs()
                ));
                let _ = conn.outbound.send(Response::failure(&err)).await;
                break;
            }
        }
    }

    // Dropping the cycle stream cancels the engine; dropping the lease
    // closes the session and frees its table entry.
    drop(conn);
}

/// Takes the sender alone: `Connection` is not `Sync`.
async fn send(outbound: &mpsc::Sender<Response>, response: Response) -> bool {
    outbound.send(response).await.is_ok()
}

async fn next_reply(cycle: &mut Option<ReplyStream>) -> Option<Result<Reply, ServiceError>> {
    match cycle {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Connection {
    fn session_state(&self) -> SessionState {
        self.lease.session().state()
    }

    /// Returns `false` once the client can no longer be reached.
    async fn handle_frame(&mut self, frame: ClientFrame) -> bool {
        match self.dispatch(frame) {
            Ok(Some(reply)) => send(&self.outbound, Response::Success(reply)).await,
            // A started cycle answers through its chunks.
            Ok(None) => true,
            Err(err) => {
                debug!(connection_id = self.lease.connection_id(), error = %err, "rejected message");
                send(&self.outbound, Response::failure(&err)).await
            }
        }
    }

    fn dispatch(&mut self, frame: ClientFrame) -> Result<Option<Reply>, ServiceError> {
        if self.session_state() == SessionState::Closed {
            return Err(ServiceError::protocol("inference session is closed"));
        }

        let text = match frame {
            ClientFrame::Text(text) => text,
            ClientFrame::Binary(_) => {
                return Err(ValidationError::Malformed("binary frames are not supported".into()).into());
            }
        };
        let message: ClientMessage = serde_json::from_str(&text)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let state = &self.state;
        match message {
            ClientMessage::OpenInferenceSession(request) => {
                let session_id = self.lease.session().open(
                    &request,
                    &state.registry,
                    &state.slots,
                    &state.config.generation,
                )?;
                debug!(connection_id = self.lease.connection_id(), %session_id, "session bound to connection");
                self.idle_deadline = Instant::now() + state.config.session_idle_timeout;
                Ok(Some(Reply::Opened))
            }
            ClientMessage::Generate(request) => {
                let cycle = self.lease.session().begin_generate(
                    request,
                    &state.slots,
                    &state.config.generation,
                )?;
                self.progress = CycleProgress::default();
                self.cycle = Some(encoder::encode(SessionMode::Streaming, cycle));
                Ok(None)
            }
        }
    }

    /// Forwards one encoder item and settles the session when the cycle
    /// ends. Returns `false` once the client can no longer be reached.
    async fn forward(&mut self, item: Option<Result<Reply, ServiceError>>) -> bool {
        let Some(item) = item else {
            self.cycle = None;
            self.lease
                .session()
                .finish_cycle(&self.progress.outputs, self.progress.token_count);
            return true;
        };

        match &item {
            Ok(Reply::Chunk(chunk)) => {
                self.progress.outputs.push_str(&chunk.outputs);
                self.progress.token_count = chunk.token_count;
                if chunk.stop {
                    self.cycle = None;
                    let state = self
                        .lease
                        .session()
                        .finish_cycle(&self.progress.outputs, self.progress.token_count);
                    debug!(
                        connection_id = self.lease.connection_id(),
                        tokens = self.progress.token_count,
                        ?state,
                        "generate cycle finished"
                    );
                    self.idle_deadline = Instant::now() + self.state.config.session_idle_timeout;
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(connection_id = self.lease.connection_id(), error = %err, "generate cycle failed");
                self.cycle = None;
                self.lease.session().close();
            }
        }

        send(&self.outbound, item.into()).await
    }
}

/// Bridges an upgraded WebSocket to [`drive_connection`].
pub async fn serve_socket(state: AppState, socket: WebSocket) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Response>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode response");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Transport errors and close frames end the inbound side.
    let inbound = stream
        .take_while(|message| {
            std::future::ready(!matches!(message, Err(_) | Ok(Message::Close(_))))
        })
        .filter_map(|message| {
            std::future::ready(match message {
                Ok(Message::Text(text)) => Some(ClientFrame::Text(text)),
                Ok(Message::Binary(bytes)) => Some(ClientFrame::Binary(bytes)),
                _ => None,
            })
        });

    drive_connection(state, Box::pin(inbound), tx).await;
    let _ = writer.await;
}
