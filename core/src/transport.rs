/// Transport adapter: typed facade over the external IM client
///
/// The IM SDK itself sits behind [`ImClient`]. [`TransportAdapter`] turns its
/// raw shapes into [`Message`]s, classifies control frames, applies the
/// best-effort policies (mark-read, presence) and maps failures into the
/// crate's error taxonomy.
use crate::control::{self, CustomElem, Inbound};
use crate::error::{ChatError, Result, REPEATED_LOGIN};
use crate::presence::NativeStatus;
use crate::render;
use crate::types::{ConversationKey, ConversationKind, ConversationMeta, Direction, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ─── Raw SDK shapes ──────────────────────────────────────────────────────────

/// Failure reported by the IM SDK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub code: i64,
    pub message: String,
}

impl TransportFault {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

pub type FaultResult<T> = std::result::Result<T, TransportFault>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RawElem {
    #[serde(rename = "TIMTextElem")]
    Text { text: String },
    #[serde(rename = "TIMCustomElem")]
    Custom(CustomElem),
    #[serde(rename = "TIMGroupTipElem")]
    GroupTip {
        #[serde(rename = "operationType")]
        operation_type: u32,
        #[serde(rename = "userIDList", default)]
        user_ids: Vec<String>,
        #[serde(rename = "operatorID", default)]
        operator_id: Option<String>,
    },
    /// Any element type this client does not model
    #[serde(other)]
    Other,
}

/// Message as the SDK hands it over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "ID", default)]
    pub legacy_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    pub from: String,
    pub flow: Direction,
    /// Seconds since the Unix epoch
    pub time: i64,
    #[serde(rename = "isPeerRead", default)]
    pub is_peer_read: bool,
    pub elem: RawElem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConversation {
    #[serde(rename = "conversationID")]
    pub conversation_id: String,
    #[serde(rename = "unreadCount", default)]
    pub unread_count: u32,
    #[serde(rename = "lastMessage", default)]
    pub last_message: Option<RawMessage>,
    #[serde(rename = "groupName", default)]
    pub group_name: Option<String>,
}

/// Status values seen in the wild: numeric `1`, or `"Online"` / `"online"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Code(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUserStatus {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "statusType", default)]
    pub status_type: Option<StatusValue>,
}

impl RawUserStatus {
    pub fn native(&self) -> NativeStatus {
        match &self.status_type {
            Some(StatusValue::Code(1)) => NativeStatus::Online,
            Some(StatusValue::Text(s)) if s.eq_ignore_ascii_case("online") => NativeStatus::Online,
            Some(_) => NativeStatus::Offline,
            None => NativeStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub user_id: String,
    pub nick: Option<String>,
    pub role: GroupRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundElem {
    Text(String),
    Custom(CustomElem),
}

/// Message handed to the SDK for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub kind: ConversationKind,
    pub elem: OutboundElem,
    pub need_read_receipt: bool,
    /// Control frames are kept out of unread counts and previews
    pub excluded_from_unread: bool,
    pub excluded_from_last_message: bool,
}

/// Raw SDK callbacks, delivered through the single registered sink
#[derive(Debug, Clone)]
pub enum ImEvent {
    MessageReceived(Vec<RawMessage>),
    ConversationListUpdated(Vec<RawConversation>),
    MessageReadByPeer(Vec<String>),
    UserStatusUpdated(Vec<RawUserStatus>),
    Error(TransportFault),
}

/// The external IM/RTC client surface
#[async_trait]
pub trait ImClient: Send + Sync {
    /// Install the event sink. Replaces any previous sink.
    fn set_event_sink(&self, sink: mpsc::Sender<ImEvent>);

    /// Drop the event sink so no further events are delivered.
    fn clear_event_sink(&self);

    async fn login(&self, user_id: &str, user_sig: &str) -> FaultResult<()>;
    async fn logout(&self) -> FaultResult<()>;

    async fn send_message(&self, message: OutboundMessage) -> FaultResult<RawMessage>;
    async fn get_message_list(&self, conversation_id: &str) -> FaultResult<Vec<RawMessage>>;
    async fn set_message_read(&self, conversation_id: &str) -> FaultResult<()>;
    async fn delete_messages(&self, conversation_id: &str, message_ids: &[String]) -> FaultResult<()>;
    async fn delete_conversation(&self, conversation_id: &str) -> FaultResult<()>;

    async fn subscribe_user_status(&self, user_ids: &[String]) -> FaultResult<()>;
    async fn get_user_status(&self, user_ids: &[String]) -> FaultResult<Vec<RawUserStatus>>;

    /// Returns the new group id
    async fn create_group(&self, name: &str) -> FaultResult<String>;
    async fn join_group(&self, group_id: &str) -> FaultResult<()>;
    async fn get_group_member_list(&self, group_id: &str) -> FaultResult<Vec<GroupMember>>;
    async fn get_group_member_profile(
        &self,
        group_id: &str,
        user_ids: &[String],
    ) -> FaultResult<Vec<GroupMember>>;
    async fn delete_group_member(&self, group_id: &str, user_ids: &[String]) -> FaultResult<()>;
    async fn quit_group(&self, group_id: &str) -> FaultResult<()>;
    async fn dismiss_group(&self, group_id: &str) -> FaultResult<()>;
}

// ─── Normalized event stream ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One delivered batch, already classified, in arrival order
    MessagesReceived(Vec<Inbound>),
    ConversationListUpdated(Vec<ConversationMeta>),
    ReadByPeer(Vec<ConversationKey>),
    StatusUpdated(Vec<(String, NativeStatus)>),
    Error { code: i64, message: String },
}

/// Ordered stream of normalized transport events
pub struct EventStream {
    rx: mpsc::Receiver<ImEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<ImEvent>) -> Self {
        Self { rx }
    }

    /// Next event, `None` once the sink is dropped
    pub async fn next(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await.map(normalize_event)
    }
}

pub fn normalize_event(event: ImEvent) -> TransportEvent {
    match event {
        ImEvent::MessageReceived(batch) => TransportEvent::MessagesReceived(
            batch.iter().filter_map(control::classify).collect(),
        ),
        ImEvent::ConversationListUpdated(list) => TransportEvent::ConversationListUpdated(
            list.iter().filter_map(normalize_conversation).collect(),
        ),
        ImEvent::MessageReadByPeer(ids) => TransportEvent::ReadByPeer(
            ids.iter().filter_map(|id| ConversationKey::parse(id)).collect(),
        ),
        ImEvent::UserStatusUpdated(list) => TransportEvent::StatusUpdated(
            list.iter().map(|s| (s.user_id.clone(), s.native())).collect(),
        ),
        ImEvent::Error(fault) => TransportEvent::Error {
            code: fault.code,
            message: fault.message,
        },
    }
}

fn normalize_conversation(raw: &RawConversation) -> Option<ConversationMeta> {
    let key = ConversationKey::parse(&raw.conversation_id)?;
    let last_message_summary = raw
        .last_message
        .as_ref()
        .and_then(control::classify)
        .and_then(|inbound| match inbound {
            Inbound::Content(msg) => Some(render::summarize(&msg.payload)),
            Inbound::Control { .. } => None,
        });
    Some(ConversationMeta {
        key,
        unread_count: raw.unread_count,
        last_message_summary,
        group_name: raw.group_name.clone(),
    })
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TransportAdapter {
    client: Arc<dyn ImClient>,
}

fn transport_err(fault: TransportFault) -> ChatError {
    ChatError::Transport(fault.to_string())
}

fn group_err(fault: TransportFault) -> ChatError {
    ChatError::Group {
        code: fault.code,
        message: fault.message,
    }
}

impl TransportAdapter {
    pub fn new(client: Arc<dyn ImClient>) -> Self {
        Self { client }
    }

    /// Establish the single long-lived event subscription. Call before login.
    pub fn subscribe(&self, capacity: usize) -> EventStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.client.set_event_sink(tx);
        EventStream::new(rx)
    }

    pub fn unsubscribe(&self) {
        self.client.clear_event_sink();
    }

    /// Repeated login on an already-authenticated client counts as success.
    pub async fn login(&self, user_id: &str, user_sig: &str) -> Result<()> {
        match self.client.login(user_id, user_sig).await {
            Ok(()) => Ok(()),
            Err(fault) if fault.code == REPEATED_LOGIN => {
                debug!("Repeated login for {}, treating as success", user_id);
                Ok(())
            }
            Err(fault) => Err(ChatError::Auth(fault.message)),
        }
    }

    pub async fn logout(&self) {
        if let Err(fault) = self.client.logout().await {
            warn!("Transport logout failed: {}", fault);
        }
    }

    /// Send user text and return the server-shaped message
    pub async fn send_text(&self, key: &ConversationKey, text: &str) -> Result<Message> {
        let outbound = OutboundMessage {
            to: key.target.clone(),
            kind: key.kind,
            elem: OutboundElem::Text(text.to_string()),
            need_read_receipt: true,
            excluded_from_unread: false,
            excluded_from_last_message: false,
        };
        self.send_content(outbound).await
    }

    /// Send user-visible custom content (attachment, group invite)
    pub async fn send_custom(&self, key: &ConversationKey, elem: CustomElem) -> Result<Message> {
        let outbound = OutboundMessage {
            to: key.target.clone(),
            kind: key.kind,
            elem: OutboundElem::Custom(elem),
            need_read_receipt: true,
            excluded_from_unread: false,
            excluded_from_last_message: false,
        };
        self.send_content(outbound).await
    }

    async fn send_content(&self, outbound: OutboundMessage) -> Result<Message> {
        let raw = self.client.send_message(outbound).await.map_err(transport_err)?;
        match control::classify(&raw) {
            Some(Inbound::Content(msg)) => Ok(msg),
            _ => Err(ChatError::Protocol(format!(
                "send echo for {} is not a content message",
                raw.conversation_id
            ))),
        }
    }

    /// Send a control frame. Control frames never count as unread or preview.
    pub async fn send_control(&self, key: &ConversationKey, action: control::ControlAction) -> Result<()> {
        let outbound = OutboundMessage {
            to: key.target.clone(),
            kind: key.kind,
            elem: OutboundElem::Custom(control::encode_control(action)?),
            need_read_receipt: false,
            excluded_from_unread: true,
            excluded_from_last_message: true,
        };
        self.client
            .send_message(outbound)
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    /// History, newest-last, with control frames filtered out
    pub async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let raw = self
            .client
            .get_message_list(&key.to_string())
            .await
            .map_err(transport_err)?;
        let mut messages: Vec<Message> = raw
            .iter()
            .filter_map(control::classify)
            .filter_map(|inbound| match inbound {
                Inbound::Content(msg) => Some(msg),
                Inbound::Control { .. } => None,
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp_seconds);
        Ok(messages)
    }

    /// Best-effort; failure is logged and swallowed.
    pub async fn mark_read(&self, key: &ConversationKey) {
        if let Err(fault) = self.client.set_message_read(&key.to_string()).await {
            warn!("mark-read failed for {}: {}", key, fault);
        }
    }

    pub async fn delete_messages(&self, key: &ConversationKey, server_ids: &[String]) -> Result<()> {
        self.client
            .delete_messages(&key.to_string(), server_ids)
            .await
            .map_err(transport_err)
    }

    pub async fn delete_conversation(&self, key: &ConversationKey) -> Result<()> {
        self.client
            .delete_conversation(&key.to_string())
            .await
            .map_err(transport_err)
    }

    /// Best-effort; failure is logged and swallowed.
    pub async fn subscribe_presence(&self, peer_ids: &[String]) {
        if let Err(fault) = self.client.subscribe_user_status(peer_ids).await {
            warn!("Presence subscribe failed: {}", fault);
        }
    }

    /// Native status per id. Unknown for every id on error or when missing.
    pub async fn get_presence(&self, peer_ids: &[String]) -> Vec<(String, NativeStatus)> {
        let reported = match self.client.get_user_status(peer_ids).await {
            Ok(list) => list,
            Err(fault) => {
                warn!("Presence query failed: {}", fault);
                Vec::new()
            }
        };
        peer_ids
            .iter()
            .map(|id| {
                let status = reported
                    .iter()
                    .find(|s| &s.user_id == id)
                    .map(RawUserStatus::native)
                    .unwrap_or(NativeStatus::Unknown);
                (id.clone(), status)
            })
            .collect()
    }

    pub async fn create_group(&self, name: &str) -> Result<String> {
        self.client.create_group(name).await.map_err(group_err)
    }

    pub async fn join_group(&self, group_id: &str) -> Result<()> {
        self.client.join_group(group_id).await.map_err(group_err)
    }

    pub async fn group_members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        self.client.get_group_member_list(group_id).await.map_err(group_err)
    }

    pub async fn group_member_profile(&self, group_id: &str, user_id: &str) -> Result<Option<GroupMember>> {
        let list = self
            .client
            .get_group_member_profile(group_id, &[user_id.to_string()])
            .await
            .map_err(group_err)?;
        Ok(list.into_iter().next())
    }

    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.client
            .delete_group_member(group_id, &[user_id.to_string()])
            .await
            .map_err(group_err)
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        self.client.quit_group(group_id).await.map_err(group_err)
    }

    pub async fn dismiss_group(&self, group_id: &str) -> Result<()> {
        self.client.dismiss_group(group_id).await.map_err(group_err)
    }
}
