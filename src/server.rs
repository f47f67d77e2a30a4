use std::future::ready;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;

use crate::signaling::session::{Session, SessionContext};

/// `GET /` answers a health check, `GET /socket` upgrades to a signaling session.
pub fn router(ctx: SessionContext) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/socket", get(socket))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn index() -> &'static str {
    "healthy"
}

async fn socket(ws: WebSocketUpgrade, State(ctx): State<SessionContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: SessionContext) {
    let (sender, receiver) = socket.split();

    // Text frames only, up to a close frame or a read error.
    let incoming = Box::pin(
        receiver
            .take_while(|message| ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|message| {
                ready(match message {
                    Ok(Message::Text(text)) => Some(text.to_string()),
                    _ => None,
                })
            }),
    );
    let outgoing = Box::pin(
        sender.with(|text: String| ready(Ok::<_, axum::Error>(Message::Text(text.into())))),
    );

    Session::run(ctx, incoming, outgoing).await;
}
