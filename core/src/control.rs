/// Custom-message codec: control frames and rich content
///
/// Everything that is not plain text travels in the transport's generic
/// custom element as a JSON `data` string. Control frames carry an `action`
/// field, content carries a `type` field.
use crate::error::{ChatError, Result};
use crate::render;
use crate::transport::{RawElem, RawMessage};
use crate::types::{
    AttachmentRef, ConversationKey, GroupInvite, GroupTip, GroupTipOp, Message, MessageId, Payload,
    SendState, ServerId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Custom element as carried by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomElem {
    pub data: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub extension: String,
}

/// Presence and connection signals. Never shown in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Typing,
    Ping,
    Pong,
    ConnectionRemoved,
}

impl ControlAction {
    fn description(self) -> &'static str {
        match self {
            ControlAction::Typing => "typing",
            ControlAction::Ping => "ping",
            ControlAction::Pong => "pong",
            ControlAction::ConnectionRemoved => "connection_removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum CustomContent {
    #[serde(rename = "image")]
    Image(AttachmentRef),
    #[serde(rename = "file")]
    File(AttachmentRef),
    #[serde(rename = "GROUP_INVITE")]
    GroupInvite(GroupInvite),
}

/// Result of classifying one inbound transport message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control {
        action: ControlAction,
        from: String,
        conversation: ConversationKey,
    },
    Content(Message),
}

pub fn encode_control(action: ControlAction) -> Result<CustomElem> {
    Ok(CustomElem {
        data: serde_json::to_string(&action)?,
        description: action.description().to_string(),
        extension: String::new(),
    })
}

pub fn encode_attachment(attachment: &AttachmentRef, is_image: bool) -> Result<CustomElem> {
    let (content, description) = if is_image {
        (CustomContent::Image(attachment.clone()), "[Image]")
    } else {
        (CustomContent::File(attachment.clone()), "[File]")
    };
    Ok(CustomElem {
        data: serde_json::to_string(&content)?,
        description: description.to_string(),
        extension: String::new(),
    })
}

pub fn encode_invite(invite: &GroupInvite) -> Result<CustomElem> {
    Ok(CustomElem {
        data: serde_json::to_string(&CustomContent::GroupInvite(invite.clone()))?,
        description: "Group Invitation".to_string(),
        extension: String::new(),
    })
}

enum Decoded {
    Control(ControlAction),
    Content(Payload),
}

fn decode_custom(elem: &CustomElem) -> Result<Decoded> {
    let value: serde_json::Value = serde_json::from_str(&elem.data)
        .map_err(|e| ChatError::Protocol(format!("custom data is not JSON: {}", e)))?;

    if value.get("action").is_some() {
        let action = serde_json::from_value::<ControlAction>(value)
            .map_err(|e| ChatError::Protocol(format!("unknown control action: {}", e)))?;
        return Ok(Decoded::Control(action));
    }

    let content = serde_json::from_value::<CustomContent>(value)
        .map_err(|e| ChatError::Protocol(format!("unknown custom content: {}", e)))?;
    Ok(Decoded::Content(match content {
        CustomContent::Image(a) => Payload::Image(a),
        CustomContent::File(a) => Payload::File(a),
        CustomContent::GroupInvite(i) => Payload::GroupInvite(i),
    }))
}

fn placeholder(elem: &CustomElem) -> Payload {
    Payload::Unknown {
        description: if elem.description.is_empty() {
            "[Custom Message]".to_string()
        } else {
            elem.description.clone()
        },
    }
}

/// Classify a raw transport message. `None` only when the conversation id
/// cannot be resolved. Malformed custom data degrades to a placeholder.
pub fn classify(raw: &RawMessage) -> Option<Inbound> {
    let conversation = ConversationKey::parse(&raw.conversation_id)?;

    let payload = match &raw.elem {
        RawElem::Text { text } => Payload::Text { text: text.clone() },
        RawElem::Custom(elem) => match decode_custom(elem) {
            Ok(Decoded::Control(action)) => {
                return Some(Inbound::Control {
                    action,
                    from: raw.from.clone(),
                    conversation,
                })
            }
            Ok(Decoded::Content(payload)) => payload,
            Err(e) => {
                debug!("Custom message from {} rendered as placeholder: {}", raw.from, e);
                placeholder(elem)
            }
        },
        RawElem::GroupTip {
            operation_type,
            user_ids,
            operator_id,
        } => Payload::GroupTip(GroupTip {
            operation: GroupTipOp::from_code(*operation_type),
            user_ids: user_ids.clone(),
            operator_id: operator_id.clone(),
        }),
        RawElem::Other => Payload::Unknown {
            description: render::UNSUPPORTED_PLACEHOLDER.to_string(),
        },
    };

    Some(Inbound::Content(Message {
        id: MessageId::Confirmed(ServerId {
            id: raw.id.clone(),
            legacy_id: raw.legacy_id.clone(),
            sequence: raw.sequence,
        }),
        conversation,
        sender_id: raw.from.clone(),
        direction: raw.flow,
        payload,
        timestamp_seconds: raw.time,
        peer_read_ack: raw.is_peer_read,
        send_state: SendState::Sent,
    }))
}
