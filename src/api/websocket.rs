//! The NT4 WebSocket endpoint: subprotocol negotiation and the per-connection
//! read/write loop (spec.md §5).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap},
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, OutboundMessage};
use crate::codec::binary::{decode_binary, DecodedFrame};
use crate::codec::control::{decode_control_batch, ClientControlMessage};
use crate::error::{ApiError, ApiResult, BrokerError};
use crate::server::AppState;

const SUBPROTOCOL_V41: &str = "v4.1.networktables.first.wpi.edu";
const SUBPROTOCOL_V40: &str = "networktables.first.wpi.edu";

pub fn routes() -> Router<AppState> {
    Router::new().route("/nt/4.1", get(nt4_handler))
}

/// Upgrades the HTTP connection, choosing the highest NT4 subprotocol the
/// client offered. Neither subprotocol offered is a 400, not a silent
/// downgrade (spec.md §5.1).
#[instrument(skip(ws, headers, state))]
async fn nt4_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    if state.broker.connection_count().await >= state.max_connections {
        warn!(max_connections = state.max_connections, "connection limit reached");
        return Err(ApiError::TooManyConnections);
    }

    let offered = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let offered: Vec<&str> = offered.split(',').map(str::trim).collect();

    let (chosen, version) = if offered.contains(&SUBPROTOCOL_V41) {
        (SUBPROTOCOL_V41, "4.1")
    } else if offered.contains(&SUBPROTOCOL_V40) {
        (SUBPROTOCOL_V40, "4.0")
    } else {
        warn!(?offered, "no compatible NT4 subprotocol offered");
        return Err(ApiError::SubprotocolRejected);
    };

    Ok(ws
        .protocols([chosen])
        .on_upgrade(move |socket| handle_socket(socket, state, version)))
}

#[instrument(skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState, version: &'static str) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = state.broker.register_connection(version).await;
    info!(connection = %conn_id, version, "NT4 connection established");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_control_frame(&state.broker, conn_id, &text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_binary_frame(&state.broker, conn_id, &bytes).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %conn_id, error = %e, "websocket transport error");
                        break;
                    }
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(OutboundMessage::Control(text)) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundMessage::Binary(bytes)) => {
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundMessage::Close) | None => break,
                }
            }
        }
    }

    state.broker.remove_connection(conn_id).await;
    info!(connection = %conn_id, "NT4 connection closed");
}

async fn handle_control_frame(broker: &Broker, conn: Uuid, text: &str) {
    for message in decode_control_batch(text) {
        if let Err(e) = dispatch_control(broker, conn, message).await {
            warn!(connection = %conn, error = %e, "control message rejected");
        }
    }
}

async fn dispatch_control(
    broker: &Broker,
    conn: Uuid,
    message: ClientControlMessage,
) -> Result<(), BrokerError> {
    match message {
        ClientControlMessage::Publish(params) => broker.handle_publish(conn, params).await,
        ClientControlMessage::Unpublish(params) => broker.handle_unpublish(conn, params).await,
        ClientControlMessage::Subscribe(params) => {
            broker.handle_subscribe(conn, params).await;
            Ok(())
        }
        ClientControlMessage::Unsubscribe(params) => {
            broker.handle_unsubscribe(conn, params).await;
            Ok(())
        }
        ClientControlMessage::Setproperties(params) => {
            broker.handle_setproperties(conn, params).await
        }
    }
}

async fn handle_binary_frame(broker: &Broker, conn: Uuid, bytes: &[u8]) {
    match decode_binary(bytes) {
        DecodedFrame::Value {
            id,
            timestamp_us,
            type_index,
            payload,
        } => {
            if let Err(e) = broker.handle_value(conn, id, timestamp_us, type_index, &payload).await {
                warn!(connection = %conn, error = %e, "value frame rejected");
            }
        }
        DecodedFrame::TimeSyncRequest {
            client_index,
            seq,
            client_time_us,
        } => {
            broker.handle_timesync(conn, client_index, seq, client_time_us).await;
        }
        DecodedFrame::Unknown => {
            warn!(connection = %conn, "dropping unrecognized binary frame");
        }
    }
}
