//! WebSocket transport: run, evaluate and step streams over one socket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use pathview_core::{ExecutionRequest, StepFrame};
use pathview_session::{FrameSink, SessionManager, TransportClosed};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    http::AppState,
    protocol::{ClientMessage, ServerMessage, budget},
};

/// A message for the socket writer, with an optional flush acknowledgement.
struct Outbound {
    msg: ServerMessage,
    delivered: Option<oneshot::Sender<()>>,
}

type Outbox = mpsc::UnboundedSender<Outbound>;

fn post(out: &Outbox, msg: ServerMessage) {
    let _ = out.send(Outbound {
        msg,
        delivered: None,
    });
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(Outbound { msg, delivered }) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            if let Some(delivered) = delivered {
                let _ = delivered.send(());
            }
        }
    });

    let mut conn = Connection::new(state.manager, tx);

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(&msg) {
            Ok(client_msg) => conn.handle(client_msg).await,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                conn.send(ServerMessage::error(format!("Invalid message: {e}")));
            }
        }
    }

    conn.shutdown();
    send_task.abort();
}

struct ActiveStream {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A run or evaluate waiting for the connection's call worker.
struct QueuedCall {
    token: String,
    request: ExecutionRequest,
}

/// Runs queued calls one at a time, in arrival order.
fn spawn_call_worker(
    manager: Arc<SessionManager>,
    out: Outbox,
) -> (mpsc::UnboundedSender<QueuedCall>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedCall>();
    let task = tokio::spawn(async move {
        while let Some(QueuedCall { token, request }) = rx.recv().await {
            match manager.execute(&token, request).await {
                Ok(result) => post(&out, ServerMessage::Result(result.into())),
                Err(e) => post(&out, ServerMessage::error(e.to_string())),
            }
        }
    });
    (tx, task)
}

/// Per-socket state.
struct Connection {
    manager: Arc<SessionManager>,
    out: Outbox,
    token: Option<String>,
    calls: mpsc::UnboundedSender<QueuedCall>,
    call_worker: JoinHandle<()>,
    stream: Option<ActiveStream>,
}

impl Connection {
    fn new(manager: Arc<SessionManager>, out: Outbox) -> Self {
        let (calls, call_worker) = spawn_call_worker(Arc::clone(&manager), out.clone());
        Self {
            manager,
            out,
            token: None,
            calls,
            call_worker,
            stream: None,
        }
    }

    fn send(&self, msg: ServerMessage) {
        post(&self.out, msg);
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Ping => self.send(ServerMessage::Pong),
            ClientMessage::Initialize { token } => {
                let token = token.or_else(|| self.token.clone());
                match self.manager.initialize(token.as_deref()).await {
                    Ok(session) => {
                        let token = session.token();
                        self.token = Some(token.clone());
                        self.send(ServerMessage::Session { token });
                    }
                    Err(e) => self.send(ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::Run { source, timeout_ms } => {
                self.queue_call(ExecutionRequest::statements(source).with_budget(budget(timeout_ms)));
            }
            ClientMessage::Evaluate { source, timeout_ms } => {
                self.queue_call(ExecutionRequest::expression(source).with_budget(budget(timeout_ms)));
            }
            ClientMessage::OpenStream { expr, timeout_ms } => self.open_stream(expr, timeout_ms),
            ClientMessage::CancelStream => {
                if let Some(stream) = self.stream.take() {
                    stream.cancel.cancel();
                }
            }
        }
    }

    fn session_token(&self) -> Option<String> {
        let token = self.token.clone();
        if token.is_none() {
            self.send(ServerMessage::error("Session not initialized"));
        }
        token
    }

    /// Calls run off the read loop so a stream cancel is never stuck behind
    /// one, but still in submission order.
    fn queue_call(&self, request: ExecutionRequest) {
        let Some(token) = self.session_token() else {
            return;
        };
        if self.calls.send(QueuedCall { token, request }).is_err() {
            self.send(ServerMessage::error("Connection is shutting down"));
        }
    }

    fn open_stream(&mut self, expr: Option<String>, timeout_ms: Option<u64>) {
        if self.stream.as_ref().is_some_and(|s| !s.task.is_finished()) {
            self.send(ServerMessage::error("A stream is already open"));
            return;
        }
        let Some(token) = self.session_token() else {
            return;
        };

        let cancel = CancellationToken::new();
        let manager = Arc::clone(&self.manager);
        let out = self.out.clone();
        let stream_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut sink = WsFrameSink { out: out.clone() };
            let result = manager
                .open_step_stream(&token, expr.as_deref(), budget(timeout_ms), &mut sink, stream_cancel)
                .await;
            match result {
                Ok(report) => post(
                    &out,
                    ServerMessage::StreamEnded {
                        outcome: report.outcome,
                        frames: report.frames,
                    },
                ),
                Err(e) => post(&out, ServerMessage::error(e.to_string())),
            }
        });
        self.stream = Some(ActiveStream { cancel, task });
    }

    /// Socket gone: stop any open stream and drop queued calls.
    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.cancel.cancel();
        }
        self.call_worker.abort();
    }
}

/// Sends frames through the socket writer and waits for each flush.
struct WsFrameSink {
    out: Outbox,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn deliver(&mut self, frame: &StepFrame) -> Result<(), TransportClosed> {
        let (delivered, flushed) = oneshot::channel();
        self.out
            .send(Outbound {
                msg: ServerMessage::Frame(frame.clone()),
                delivered: Some(delivered),
            })
            .map_err(|_| TransportClosed)?;
        flushed.await.map_err(|_| TransportClosed)
    }

    async fn closed(&self) {
        self.out.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pathview_core::CallKind;
    use pathview_session::{ManagerConfig, StreamOutcome};
    use serde_json::json;

    use super::*;

    /// A connection whose writer acknowledges every message immediately.
    fn connection() -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let manager = Arc::new(SessionManager::new(ManagerConfig::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Outbound { msg, delivered }) = rx.recv().await {
                if seen_tx.send(msg).is_err() {
                    break;
                }
                if let Some(delivered) = delivered {
                    let _ = delivered.send(());
                }
            }
        });
        (Connection::new(manager, tx), seen_rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn initialized() -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (mut conn, mut rx) = connection();
        conn.handle(ClientMessage::Initialize { token: None }).await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Session { .. }));
        (conn, rx)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (mut conn, mut rx) = connection();
        conn.handle(ClientMessage::Ping).await;
        assert_eq!(next(&mut rx).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_calls_require_session() {
        let (mut conn, mut rx) = connection();
        conn.handle(ClientMessage::Run {
            source: "x = 1".to_string(),
            timeout_ms: None,
        })
        .await;
        assert_eq!(next(&mut rx).await, ServerMessage::error("Session not initialized"));
    }

    #[tokio::test]
    async fn test_reinitialize_keeps_token() {
        let (mut conn, mut rx) = connection();
        conn.handle(ClientMessage::Initialize { token: None }).await;
        let ServerMessage::Session { token: first } = next(&mut rx).await else {
            panic!("expected session");
        };
        conn.handle(ClientMessage::Initialize { token: None }).await;
        assert_eq!(next(&mut rx).await, ServerMessage::Session { token: first });
    }

    #[tokio::test]
    async fn test_run_then_evaluate() {
        let (mut conn, mut rx) = initialized().await;

        conn.handle(ClientMessage::Run {
            source: "x = 20".to_string(),
            timeout_ms: None,
        })
        .await;
        let ServerMessage::Result(run) = next(&mut rx).await else {
            panic!("expected result");
        };
        assert!(run.success);
        assert_eq!(run.call, CallKind::RunStatements);

        conn.handle(ClientMessage::Evaluate {
            source: "x + 1".to_string(),
            timeout_ms: None,
        })
        .await;
        let ServerMessage::Result(eval) = next(&mut rx).await else {
            panic!("expected result");
        };
        assert_eq!(eval.value, Some(json!(21)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pipelined_calls_run_in_order() {
        let (mut conn, mut rx) = initialized().await;

        conn.handle(ClientMessage::Run {
            source: "log = ''".to_string(),
            timeout_ms: None,
        })
        .await;
        for i in 0..200 {
            conn.handle(ClientMessage::Run {
                source: format!("log = log .. '{i},'"),
                timeout_ms: None,
            })
            .await;
        }
        conn.handle(ClientMessage::Evaluate {
            source: "log".to_string(),
            timeout_ms: None,
        })
        .await;

        for _ in 0..201 {
            let ServerMessage::Result(run) = next(&mut rx).await else {
                panic!("expected result");
            };
            assert_eq!(run.call, CallKind::RunStatements);
            assert!(run.success);
        }
        let ServerMessage::Result(eval) = next(&mut rx).await else {
            panic!("expected result");
        };
        let expected: String = (0..200).map(|i| format!("{i},")).collect();
        assert_eq!(eval.value, Some(json!(expected)));
    }

    #[tokio::test]
    async fn test_cancel_is_not_queued_behind_calls() {
        let (mut conn, mut rx) = initialized().await;
        conn.handle(ClientMessage::Run {
            source: "function forever() return { done = false } end".to_string(),
            timeout_ms: None,
        })
        .await;
        next(&mut rx).await;

        conn.handle(ClientMessage::OpenStream {
            expr: Some("forever()".to_string()),
            timeout_ms: None,
        })
        .await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Frame(_)));

        // waits behind the stream for the namespace
        conn.handle(ClientMessage::Run {
            source: "after = true".to_string(),
            timeout_ms: None,
        })
        .await;
        conn.handle(ClientMessage::CancelStream).await;

        let (mut ended, mut ran) = (false, false);
        while !(ended && ran) {
            match next(&mut rx).await {
                ServerMessage::Frame(_) => assert!(!ended),
                ServerMessage::StreamEnded { outcome, .. } => {
                    assert_eq!(outcome, StreamOutcome::Cancelled);
                    ended = true;
                }
                ServerMessage::Result(run) => {
                    assert!(run.success);
                    ran = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_frames_then_end() {
        let (mut conn, mut rx) = initialized().await;
        conn.handle(ClientMessage::Run {
            source: "n = 0\nfunction step() n = n + 1 return { done = n >= 2 } end".to_string(),
            timeout_ms: None,
        })
        .await;
        next(&mut rx).await;

        conn.handle(ClientMessage::OpenStream {
            expr: Some("step()".to_string()),
            timeout_ms: None,
        })
        .await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Frame(f) if !f.is_done()));
        assert!(matches!(next(&mut rx).await, ServerMessage::Frame(f) if f.is_done()));
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::StreamEnded {
                outcome: StreamOutcome::Completed,
                frames: 2
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_stream_ends_it() {
        let (mut conn, mut rx) = initialized().await;
        conn.handle(ClientMessage::Run {
            source: "function forever() return { done = false } end".to_string(),
            timeout_ms: None,
        })
        .await;
        next(&mut rx).await;

        conn.handle(ClientMessage::OpenStream {
            expr: Some("forever()".to_string()),
            timeout_ms: None,
        })
        .await;
        assert!(matches!(next(&mut rx).await, ServerMessage::Frame(_)));

        conn.handle(ClientMessage::OpenStream {
            expr: None,
            timeout_ms: None,
        })
        .await;
        // frames may still arrive until the rejection
        loop {
            match next(&mut rx).await {
                ServerMessage::Frame(_) => {}
                msg => {
                    assert_eq!(msg, ServerMessage::error("A stream is already open"));
                    break;
                }
            }
        }

        conn.handle(ClientMessage::CancelStream).await;
        loop {
            match next(&mut rx).await {
                ServerMessage::Frame(_) => {}
                ServerMessage::StreamEnded { outcome, .. } => {
                    assert_eq!(outcome, StreamOutcome::Cancelled);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
