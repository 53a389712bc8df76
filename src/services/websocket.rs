//! WebSocket Service
//!
//! Streams ledger lifecycle events to connected clients.
//!
//! # Channels
//! - `all_events`: every committed event
//! - `participant:<address>`: events of one owner or pool manager
//! - `kind:<event kind>`: one event kind (`position_created`, ...)
//!
//! Events carry ids, public metadata and content hashes only, so any client
//! may subscribe to any channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::services::settlement::{EventFilter, EventKind, LedgerEvent};
use crate::types::OwnerId;

/// WebSocket 메시지 타입 (송신)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// 원장 이벤트
    Event(LedgerEvent),
    /// 구독 확인
    Subscribed(SubscriptionConfirm),
    /// 에러
    Error(WsError),
    Pong,
}

/// WebSocket 에러
#[derive(Debug, Clone, Serialize)]
pub struct WsError {
    pub code: i32,
    pub message: String,
}

/// 구독 확인
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionConfirm {
    pub channel: String,
    pub subscribed: bool,
}

/// 구독 채널
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Channel {
    AllEvents,
    Participant(OwnerId),
    Kind(EventKind),
}

impl Channel {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "all_events" {
            return Ok(Channel::AllEvents);
        }
        if let Some(addr) = s.strip_prefix("participant:") {
            return OwnerId::new(addr).map(Channel::Participant).map_err(|e| anyhow!(e));
        }
        if let Some(kind) = s.strip_prefix("kind:") {
            return EventKind::parse(kind)
                .map(Channel::Kind)
                .ok_or_else(|| anyhow!("unknown event kind: {}", kind));
        }
        Err(anyhow!("unknown channel: {}", s))
    }

    /// 채널에 해당하는 이벤트 필터
    pub fn filter(&self) -> EventFilter {
        match self {
            Channel::AllEvents => EventFilter::all(),
            Channel::Participant(owner) => EventFilter::participant(owner.clone()),
            Channel::Kind(kind) => EventFilter {
                kinds: vec![*kind],
                participant: None,
            },
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::AllEvents => write!(f, "all_events"),
            Channel::Participant(owner) => write!(f, "participant:{}", owner),
            Channel::Kind(kind) => write!(f, "kind:{}", kind.as_str()),
        }
    }
}

/// 연결 상태
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub connected_at: i64,
    pub subscriptions: Vec<Channel>,
    pub last_activity: i64,
}

impl ConnectionInfo {
    pub fn new(id: String) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id,
            connected_at: now,
            subscriptions: Vec::new(),
            last_activity: now,
        }
    }
}

/// WebSocket Hub
///
/// 연결과 구독 상태를 관리. 실제 이벤트 스트림은 ledger 구독에서 온다.
///
/// # Architecture
/// ```text
/// ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
/// │   Client 1  │────▶│              │────▶│  all_events      │
/// ├─────────────┤     │    WsHub     │     ├──────────────────┤
/// │   Client 2  │────▶│  (registry)  │────▶│  participant:0x… │
/// └─────────────┘     └──────────────┘     └──────────────────┘
///                            ▲
///                            │ LedgerEvent stream
///                     SettlementAdapter
/// ```
#[derive(Default)]
pub struct WsHub {
    connections: Arc<RwLock<HashMap<String, ConnectionInfo>>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 연결 등록
    pub async fn register_connection(&self, info: ConnectionInfo) {
        let mut conns = self.connections.write().await;
        conns.insert(info.id.clone(), info);
    }

    /// 연결 해제
    pub async fn unregister_connection(&self, id: &str) {
        let mut conns = self.connections.write().await;
        conns.remove(id);
    }

    /// 활성 연결 수
    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 구독 추가. 이미 구독 중이면 false
    pub async fn add_subscription(&self, id: &str, channel: Channel) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get_mut(id) {
            Some(info) => {
                info.last_activity = Utc::now().timestamp();
                if info.subscriptions.contains(&channel) {
                    false
                } else {
                    info.subscriptions.push(channel);
                    true
                }
            }
            None => false,
        }
    }

    /// 구독 취소. 구독 중이 아니었으면 false
    pub async fn remove_subscription(&self, id: &str, channel: &Channel) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get_mut(id) {
            Some(info) => {
                info.last_activity = Utc::now().timestamp();
                let before = info.subscriptions.len();
                info.subscriptions.retain(|c| c != channel);
                info.subscriptions.len() != before
            }
            None => false,
        }
    }

    pub async fn subscriptions(&self, id: &str) -> Vec<Channel> {
        self.connections
            .read()
            .await
            .get(id)
            .map(|info| info.subscriptions.clone())
            .unwrap_or_default()
    }
}

/// WebSocket 클라이언트 메시지 (수신)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientMessage {
    /// 채널 구독
    Subscribe { channel: String },
    /// 구독 취소
    Unsubscribe { channel: String },
    /// Ping (keepalive)
    Ping,
}

/// 클라이언트 메시지 파싱
pub fn parse_client_message(data: &str) -> Result<ClientMessage> {
    serde_json::from_str(data).map_err(Into::into)
}

/// 서버 메시지 직렬화
pub fn serialize_message(msg: &WsMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(Into::into)
}
