/// Shared types for the chat layer
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Conversations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKind {
    /// One-to-one with a peer
    C2C,
    /// Group chat
    Group,
}

impl ConversationKind {
    fn prefix(self) -> &'static str {
        match self {
            ConversationKind::C2C => "C2C",
            ConversationKind::Group => "GROUP",
        }
    }
}

/// Composite conversation identifier, rendered the way the transport names
/// conversations: `C2C<peerId>` / `GROUP<groupId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub kind: ConversationKind,
    pub target: String,
}

impl ConversationKey {
    pub fn c2c(peer_id: impl Into<String>) -> Self {
        Self {
            kind: ConversationKind::C2C,
            target: peer_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            kind: ConversationKind::Group,
            target: group_id.into(),
        }
    }

    /// Parse a transport conversation id. `None` for system or unknown ids.
    pub fn parse(conversation_id: &str) -> Option<Self> {
        if let Some(peer) = conversation_id.strip_prefix("C2C") {
            if !peer.is_empty() {
                return Some(Self::c2c(peer));
            }
        }
        if let Some(group) = conversation_id.strip_prefix("GROUP") {
            if !group.is_empty() {
                return Some(Self::group(group));
            }
        }
        None
    }

    pub fn is_peer(&self) -> bool {
        self.kind == ConversationKind::C2C
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.target)
    }
}

/// Conversation list row (unread count, preview)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub key: ConversationKey,
    pub unread_count: u32,
    pub last_message_summary: Option<String>,
    /// Group display name, when the transport supplies a group profile
    pub group_name: Option<String>,
}

/// The conversation currently open in the UI (single active room)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub key: ConversationKey,
    pub display_name: String,
    /// Backend connection row, for peer rooms opened from the connections list
    pub connection_id: Option<String>,
}

impl Room {
    pub fn peer(connection: &Connection) -> Self {
        Self {
            key: ConversationKey::c2c(connection.user.id.clone()),
            display_name: connection.user.username.clone(),
            connection_id: Some(connection.connection_id.clone()),
        }
    }

    pub fn group(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: ConversationKey::group(group_id),
            display_name: name.into(),
            connection_id: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.key.target
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Locally generated id of an unconfirmed send, rendered `temp-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// Server identity of a confirmed message. The transport may fill any of the
/// three fields; two messages are the same if any populated field agrees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerId {
    pub id: Option<String>,
    pub legacy_id: Option<String>,
    pub sequence: Option<u64>,
}

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Preferred id for transport calls
    pub fn primary(&self) -> Option<&str> {
        self.id.as_deref().or(self.legacy_id.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.legacy_id.is_none() && self.sequence.is_none()
    }

    pub fn matches(&self, other: &ServerId) -> bool {
        let ids = [self.id.as_deref(), self.legacy_id.as_deref()];
        let other_ids = [other.id.as_deref(), other.legacy_id.as_deref()];
        let id_hit = ids
            .iter()
            .flatten()
            .any(|a| other_ids.iter().flatten().any(|b| a == b));
        let seq_hit = matches!((self.sequence, other.sequence), (Some(a), Some(b)) if a == b);
        id_hit || seq_hit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageId {
    Pending { local_id: LocalId },
    Confirmed(ServerId),
}

impl MessageId {
    /// Identity comparison used for de-duplication and removal
    pub fn same_as(&self, other: &MessageId) -> bool {
        match (self, other) {
            (MessageId::Pending { local_id: a }, MessageId::Pending { local_id: b }) => a == b,
            (MessageId::Confirmed(a), MessageId::Confirmed(b)) => a.matches(b),
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    GroupInvite,
    GroupTip,
    Unknown,
}

/// Uploaded file referenced by an image or file message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    #[serde(rename = "groupID")]
    pub group_id: String,
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "inviterName")]
    pub inviter_name: String,
}

/// Group membership notification codes, as the transport numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupTipOp {
    MemberJoin,
    MemberQuit,
    MemberKickedOut,
    MemberSetAdmin,
    MemberCancelAdmin,
    GroupProfileUpdated,
    MemberProfileUpdated,
    Other(u32),
}

impl GroupTipOp {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => GroupTipOp::MemberJoin,
            2 => GroupTipOp::MemberQuit,
            3 => GroupTipOp::MemberKickedOut,
            4 => GroupTipOp::MemberSetAdmin,
            5 => GroupTipOp::MemberCancelAdmin,
            6 => GroupTipOp::GroupProfileUpdated,
            7 => GroupTipOp::MemberProfileUpdated,
            other => GroupTipOp::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTip {
    pub operation: GroupTipOp,
    pub user_ids: Vec<String>,
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text { text: String },
    Image(AttachmentRef),
    File(AttachmentRef),
    GroupInvite(GroupInvite),
    GroupTip(GroupTip),
    /// Anything we could not decode. Rendered as a placeholder.
    Unknown { description: String },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text { .. } => MessageKind::Text,
            Payload::Image(_) => MessageKind::Image,
            Payload::File(_) => MessageKind::File,
            Payload::GroupInvite(_) => MessageKind::GroupInvite,
            Payload::GroupTip(_) => MessageKind::GroupTip,
            Payload::Unknown { .. } => MessageKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender_id: String,
    pub direction: Direction,
    pub payload: Payload,
    pub timestamp_seconds: i64,
    pub peer_read_ack: bool,
    pub send_state: SendState,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Locally echoed text that has not been confirmed yet
    pub fn optimistic_text(
        local_id: LocalId,
        conversation: ConversationKey,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        timestamp_seconds: i64,
    ) -> Self {
        Self {
            id: MessageId::Pending { local_id },
            conversation,
            sender_id: sender_id.into(),
            direction: Direction::Out,
            payload: Payload::Text { text: text.into() },
            timestamp_seconds,
            peer_read_ack: false,
            send_state: SendState::Pending,
        }
    }
}

// ─── Connections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    /// Public handle such as `#AX12`
    pub display_id: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Accepted,
}

/// An accepted connection, seen from the local user's side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub user: UserProfile,
    pub connection_id: String,
}

/// A pending request received by the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: String,
    pub sender: UserProfile,
}

// ─── UI events ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Change notifications broadcast to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A conversation's message list changed
    ConversationChanged { key: ConversationKey },
    /// Unread counts / previews changed
    ConversationListChanged,
    /// A peer's typing flag, last-seen or status changed
    PresenceChanged { peer_id: String },
    ConnectionsChanged,
    RequestsChanged,
    ActiveRoomChanged { room: Option<Room> },
    /// One user-facing notification
    Notice { level: NoticeLevel, message: String },
    /// Everything was reset (logout)
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_key_round_trips_transport_ids() {
        let key = ConversationKey::parse("C2Cuser_42").unwrap();
        assert_eq!(key, ConversationKey::c2c("user_42"));
        assert_eq!(key.to_string(), "C2Cuser_42");

        let group = ConversationKey::parse("GROUP@TGS#abc").unwrap();
        assert_eq!(group.kind, ConversationKind::Group);
        assert_eq!(group.to_string(), "GROUP@TGS#abc");

        assert!(ConversationKey::parse("@TIM#SYSTEM").is_none());
        assert!(ConversationKey::parse("C2C").is_none());
    }

    #[test]
    fn test_server_id_matches_any_alias() {
        let by_id = ServerId::new("m1");
        let by_legacy = ServerId {
            legacy_id: Some("m1".to_string()),
            ..Default::default()
        };
        let by_seq = ServerId {
            id: Some("other".to_string()),
            sequence: Some(7),
            ..Default::default()
        };
        let seq_only = ServerId {
            sequence: Some(7),
            ..Default::default()
        };

        assert!(by_id.matches(&by_legacy));
        assert!(by_seq.matches(&seq_only));
        assert!(!by_id.matches(&seq_only));
        assert!(!ServerId::default().matches(&ServerId::default()));
    }

    #[test]
    fn test_pending_never_matches_confirmed() {
        let pending = MessageId::Pending { local_id: LocalId(1) };
        let confirmed = MessageId::Confirmed(ServerId::new("temp-1"));
        assert!(!pending.same_as(&confirmed));
        assert!(pending.same_as(&MessageId::Pending { local_id: LocalId(1) }));
        assert_eq!(LocalId(1).to_string(), "temp-1");
    }

    #[test]
    fn test_group_tip_codes() {
        assert_eq!(GroupTipOp::from_code(1), GroupTipOp::MemberJoin);
        assert_eq!(GroupTipOp::from_code(3), GroupTipOp::MemberKickedOut);
        assert_eq!(GroupTipOp::from_code(6), GroupTipOp::GroupProfileUpdated);
        assert_eq!(GroupTipOp::from_code(99), GroupTipOp::Other(99));
    }
}
