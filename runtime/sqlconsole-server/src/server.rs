//! HTTP surface: the `/ws` upgrade plus static files everywhere else.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use sqlconsole_db::{CancelToken, Store};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::SessionConfig;
use crate::protocol::Frame;
use crate::session::{Channel, Session, SessionError};

pub struct AppState<S> {
    store: Arc<S>,
    session: SessionConfig,
    shutdown: CancelToken,
    next_session: Arc<AtomicU64>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            session: self.session,
            shutdown: self.shutdown.clone(),
            next_session: Arc::clone(&self.next_session),
        }
    }
}

impl<S: Store> AppState<S> {
    /// Every session receives a child of `shutdown`.
    pub fn new(store: Arc<S>, session: SessionConfig, shutdown: CancelToken) -> Self {
        Self {
            store,
            session,
            shutdown,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }
}

pub fn router<S: Store>(state: AppState<S>, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(upgrade::<S>))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade<S: Store>(ws: WebSocketUpgrade, State(state): State<AppState<S>>) -> impl IntoResponse {
    let config = state.session;
    ws.read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(config.max_message_size)
        .max_frame_size(config.max_frame_size)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

/// Runs one session and logs how it ended.
async fn serve_socket<S: Store>(socket: WebSocket, state: AppState<S>) {
    let id = state.next_session.fetch_add(1, Ordering::Relaxed);
    let session = Session::new(state.store, WsChannel(socket), state.shutdown.child());
    async move {
        debug!("session opened");
        match session.run().await {
            Ok(end) => debug!(?end, "session closed"),
            Err(err) => warn!(error = %err, "session terminated"),
        }
    }
    .instrument(info_span!("session", id))
    .await
}

pub struct WsChannel(WebSocket);

impl Channel for WsChannel {
    fn receive(&mut self) -> impl Future<Output = Result<Option<Frame>, SessionError>> + Send {
        async move {
            loop {
                let message = match self.0.recv().await {
                    None => return Ok(None),
                    Some(Err(err)) => return Err(SessionError::Receive(err.to_string())),
                    Some(Ok(message)) => message,
                };
                match message {
                    Message::Text(text) => return Ok(Some(Frame::Text(text.as_str().to_owned()))),
                    Message::Binary(bytes) => return Ok(Some(Frame::Binary(bytes.to_vec()))),
                    Message::Close(_) => return Ok(None),
                    Message::Ping(_) | Message::Pong(_) => continue,
                }
            }
        }
    }

    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), SessionError>> + Send {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        async move {
            self.0
                .send(message)
                .await
                .map_err(|err| SessionError::Send(err.to_string()))
        }
    }
}
