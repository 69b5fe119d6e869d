//! HTTP routes and the WebSocket transport.
//!
//! `GET /shelly`, `/settings` and `/status` serve the Gen1 payloads,
//! `POST /rpc` and `GET /rpc/:method` serve RPC over plain HTTP, and
//! `GET /rpc` with an upgrade header opens a WebSocket RPC session.

use crate::rpc::{Frame, RpcRequest};
use crate::shelly_device::ShellyDevice;
use crate::websocket_session::WebsocketSession;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{Sink, SinkExt, StreamExt};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub device: Arc<ShellyDevice>,
    pub throttling_interval: Duration,
    pub outbound_queue_size: usize,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/shelly", get(shelly_get))
        .route("/settings", get(settings_get))
        .route("/status", get(status_get))
        .route("/rpc", get(websocket_upgrade).post(rpc_post))
        .route("/rpc/:method", get(rpc_get))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Serves HTTP until the state's shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "http server listening");
    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn shelly_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::trace!(%remote, "GET /shelly");
    let identity = state.device.identity(remote.ip());
    Json(state.device.shelly_info(&identity))
}

async fn settings_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::trace!(%remote, "GET /settings");
    let identity = state.device.identity(remote.ip());
    Json(state.device.settings(&identity))
}

async fn status_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::trace!(%remote, "GET /status");
    let identity = state.device.identity(remote.ip());
    Json(state.device.status(&identity))
}

async fn rpc_post(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    let response = match RpcRequest::decode(&body) {
        Ok(request) => state.device.dispatch(remote.ip(), &request),
        Err(e) => {
            tracing::debug!(%remote, error = %e, "undecodable http rpc body");
            state.device.parse_error(remote.ip())
        }
    };
    Json(response).into_response()
}

/// Gen2 style `GET /rpc/EM.GetStatus?id=0`, answers with the bare result.
async fn rpc_get(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = (!query.is_empty()).then(|| {
        serde_json::Value::Object(
            query
                .into_iter()
                .map(|(key, value)| (key, query_value(value)))
                .collect(),
        )
    });
    let request = RpcRequest {
        id: None,
        src: None,
        method,
        params,
    };

    let response = state.device.dispatch(remote.ip(), &request);
    match (response.result, response.error) {
        (Some(result), _) => Json(result).into_response(),
        (None, Some(error)) => (StatusCode::NOT_FOUND, Json(error)).into_response(),
        (None, None) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

// Numeric query parameters are passed on as numbers
fn query_value(value: String) -> serde_json::Value {
    match value.parse::<i64>() {
        Ok(number) => serde_json::Value::from(number),
        Err(_) => serde_json::Value::String(value),
    }
}

async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Drives one WebSocket connection: a writer task drains the session's
/// outbound channel, this task feeds inbound frames to the session.
async fn handle_websocket(socket: WebSocket, remote: SocketAddr, state: AppState) {
    tracing::info!(%remote, "websocket client connected");

    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(state.outbound_queue_size.max(1));
    let cancel = state.shutdown.child_token();

    let mut session = WebsocketSession::new(
        remote,
        Arc::clone(&state.device),
        outbound_tx,
        cancel.clone(),
        state.throttling_interval,
    );

    let writer = tokio::spawn(write_frames(sink, outbound_rx, cancel.clone(), remote));

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => session.on_inbound_frame(Frame::Text(text)),
            Some(Ok(Message::Binary(bytes))) => session.on_inbound_frame(Frame::Binary(bytes)),
            Some(Ok(Message::Close(_))) | None => break,
            // Pings are answered by axum
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(%remote, error = %e, "websocket read failed");
                break;
            }
        }
    }

    session.close();
    let _ = writer.await;
    tracing::info!(%remote, "websocket client disconnected");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

/// Writes queued frames to the socket until the connection is cancelled.
/// Frames already queued at that point still get a best effort send.
async fn write_frames<S>(
    mut sink: S,
    mut outbound_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    remote: SocketAddr,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut write_failed = false;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(to_message(frame)).await {
            tracing::debug!(%remote, error = %e, "websocket write failed");
            write_failed = true;
            cancel.cancel();
            break;
        }
    }

    if !write_failed {
        while let Ok(frame) = outbound_rx.try_recv() {
            if sink.send(to_message(frame)).await.is_err() {
                break;
            }
        }
    }
    let _ = sink.close().await;
}
