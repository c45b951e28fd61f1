//! HTTP/SSE transport: the `/sse` stream endpoint and the `/message` POST
//! endpoint, behind API key authentication.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::context::GatewayContext;
use crate::error::{Error, Result};
use crate::protocol::JsonRpcResponse;
use crate::server::McpServer;
use crate::session::{SessionConnection, SessionRegistry};

/// Path of the stream endpoint.
pub const SSE_PATH: &str = "/sse";

/// Path of the message endpoint.
pub const MESSAGE_PATH: &str = "/message";

/// Push side of one SSE stream. Messages are serialized here and framed as
/// `event: message` by the stream.
///
/// Closing is signalled separately from the message channel: in-flight calls
/// hold clones of the connection, so the sender alone never drops while a
/// call is parked on approval.
pub struct SseConnection {
    tx: mpsc::UnboundedSender<String>,
    closing: watch::Sender<bool>,
}

impl SseConnection {
    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }
}

/// Completes once `closing` flips to true or its sender is gone.
async fn close_signal(mut closing: watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

#[async_trait::async_trait]
impl SessionConnection for SseConnection {
    fn send(&self, message: &JsonRpcResponse) -> Result<()> {
        if self.is_closing() {
            return Err(Error::Internal("session stream closed".into()));
        }
        let data = serde_json::to_string(message)?;
        self.tx
            .send(data)
            .map_err(|_| Error::Internal("session stream closed".into()))
    }

    fn is_closed(&self) -> bool {
        self.is_closing() || self.tx.is_closed()
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = close_signal(self.closing.subscribe()) => {}
        }
    }

    fn close(&self) {
        self.closing.send_replace(true);
    }
}

/// State shared by the transport handlers.
#[derive(Clone)]
pub struct TransportState {
    context: Arc<GatewayContext>,
    sessions: Arc<SessionRegistry>,
    server: Arc<McpServer>,
}

impl TransportState {
    /// Bundle the pieces the handlers need.
    pub fn new(
        context: Arc<GatewayContext>,
        sessions: Arc<SessionRegistry>,
        server: Arc<McpServer>,
    ) -> Self {
        Self {
            context,
            sessions,
            server,
        }
    }
}

/// Build the gateway router.
pub fn router(state: TransportState) -> Router {
    Router::new()
        .route(SSE_PATH, get(sse_handler))
        .route(MESSAGE_PATH, post(message_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// Checks the bearer header, falling back to the `key` query parameter.
async fn auth_middleware(
    State(state): State<TransportState>,
    req: Request,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    let presented = bearer.or_else(|| {
        Query::<KeyQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.key)
    });

    let config = state.context.config().snapshot().await;
    if !config.authorize(presented.as_deref()) {
        return Error::Authorization(format!("{} {}", req.method(), req.uri().path()))
            .into_response();
    }

    next.run(req).await
}

/// Unregisters the session when the stream is dropped.
struct SessionGuard {
    context: Arc<GatewayContext>,
    sessions: Arc<SessionRegistry>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.sessions.unregister(&self.id).is_some() {
            self.context
                .info(format!("Connection closed for session {}", self.id));
        }
    }
}

/// SSE event stream that owns its session's guard.
struct SessionStream<S> {
    inner: S,
    _guard: SessionGuard,
}

impl<S> Stream for SessionStream<S>
where
    S: Stream<Item = std::result::Result<Event, Infallible>> + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn sse_handler(
    State(state): State<TransportState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let (closing, close_rx) = watch::channel(false);
    state
        .sessions
        .register(id.clone(), Arc::new(SseConnection { tx, closing }))?;

    let peer = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    state
        .context
        .info(format!("New connection established from {peer}"));
    tracing::debug!(session = %id, live = state.sessions.len(), "Session registered");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGE_PATH}?sessionId={id}"));
    let messages = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().event("message").data(data)))
        .take_until(Box::pin(close_signal(close_rx)));

    let stream = SessionStream {
        inner: stream::once(futures::future::ready(Ok(endpoint))).chain(messages),
        _guard: SessionGuard {
            context: state.context.clone(),
            sessions: state.sessions.clone(),
            id,
        },
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    session_id: Option<String>,
}

async fn message_handler(
    State(state): State<TransportState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let id = query.session_id.unwrap_or_default();
    let session = state.sessions.lookup(&id)?;

    // Reject garbage here; the JSON-RPC layer only sees well-formed JSON.
    let _: serde_json::Value = serde_json::from_slice(&body)?;
    let message = String::from_utf8_lossy(&body).into_owned();

    let server = state.server.clone();
    tokio::spawn(async move {
        let connection = session.connection.clone();
        let response = tokio::select! {
            response = server.handle_message(&message) => response,
            // Dropping the call denies any approval it was waiting on.
            _ = connection.closed() => {
                tracing::debug!(session = %session.id, "Client went away, call abandoned");
                return;
            }
        };

        if let Some(response) = response {
            if let Err(e) = connection.send(&response) {
                tracing::debug!(session = %session.id, "Response dropped: {}", e);
            }
        }
    });

    Ok((StatusCode::ACCEPTED, "Accepted"))
}
