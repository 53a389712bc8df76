//! WebSocket Routes
//!
//! 원장 이벤트 스트리밍 WebSocket 엔드포인트
//!
//! # Endpoints
//! - `GET /ws` - WebSocket 연결
//!
//! # Protocol
//! ```text
//! → {"action":"Subscribe","channel":"participant:0x..."}
//! ← {"type":"Subscribed","data":{"channel":"participant:0x...","subscribed":true}}
//! ← {"type":"Event","data":{"type":"position_created","data":{...}}}
//! → {"action":"Ping"}
//! ← {"type":"Pong"}
//! ```

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::services::websocket::{
    parse_client_message, serialize_message, Channel, ClientMessage, ConnectionInfo,
    SubscriptionConfirm, WsError,
};
use crate::services::WsMessage;
use crate::AppState;

/// 연결당 송신 버퍼
const OUTBOUND_BUFFER: usize = 256;

/// WebSocket 업그레이드 핸들러
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// WebSocket 연결 처리
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);

    // 연결 ID 생성 및 등록
    let conn_id = uuid::Uuid::new_v4().to_string();
    state
        .hub
        .register_connection(ConnectionInfo::new(conn_id.clone()))
        .await;
    tracing::debug!("WebSocket connection {} opened", conn_id);

    // 송신 태스크
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serialize_message(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to serialize ws message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // 채널별 이벤트 전달 태스크
    let mut forwarders: HashMap<Channel, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &conn_id, &tx, &mut forwarders, &text).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }

    for (_, task) in forwarders.drain() {
        task.abort();
    }
    send_task.abort();

    // 연결 해제
    state.hub.unregister_connection(&conn_id).await;
    tracing::debug!("WebSocket connection {} closed", conn_id);
}

/// 클라이언트 메시지 처리
async fn handle_client_message(
    state: &AppState,
    conn_id: &str,
    tx: &mpsc::Sender<WsMessage>,
    forwarders: &mut HashMap<Channel, JoinHandle<()>>,
    text: &str,
) {
    let msg = match parse_client_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = tx.send(error_message(400, format!("invalid message: {}", e))).await;
            return;
        }
    };

    match msg {
        ClientMessage::Subscribe { channel } => {
            let channel = match Channel::parse(&channel) {
                Ok(channel) => channel,
                Err(e) => {
                    let _ = tx.send(error_message(400, e.to_string())).await;
                    return;
                }
            };

            if state.hub.add_subscription(conn_id, channel.clone()).await {
                let mut events = state.ledger.subscribe(channel.filter());
                let out = tx.clone();
                let task = tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if out.send(WsMessage::Event(event)).await.is_err() {
                            break;
                        }
                    }
                });
                forwarders.insert(channel.clone(), task);
                tracing::info!("Connection {} subscribed to {}", conn_id, channel);
            }

            let _ = tx
                .send(WsMessage::Subscribed(SubscriptionConfirm {
                    channel: channel.to_string(),
                    subscribed: true,
                }))
                .await;
        }
        ClientMessage::Unsubscribe { channel } => {
            let channel = match Channel::parse(&channel) {
                Ok(channel) => channel,
                Err(e) => {
                    let _ = tx.send(error_message(400, e.to_string())).await;
                    return;
                }
            };

            state.hub.remove_subscription(conn_id, &channel).await;
            if let Some(task) = forwarders.remove(&channel) {
                task.abort();
                tracing::info!("Connection {} unsubscribed from {}", conn_id, channel);
            }

            let _ = tx
                .send(WsMessage::Subscribed(SubscriptionConfirm {
                    channel: channel.to_string(),
                    subscribed: false,
                }))
                .await;
        }
        ClientMessage::Ping => {
            let _ = tx.send(WsMessage::Pong).await;
        }
    }
}

fn error_message(code: i32, message: String) -> WsMessage {
    WsMessage::Error(WsError { code, message })
}
