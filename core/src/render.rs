/// Presentation helpers: names, group tips, list previews
use crate::types::{GroupTip, GroupTipOp, Payload, UserProfile};

pub const UNSUPPORTED_PLACEHOLDER: &str = "[Unsupported Message Type]";

/// Maps user ids to display names
pub struct NameResolver<'a> {
    self_id: &'a str,
    known: &'a [UserProfile],
}

impl<'a> NameResolver<'a> {
    pub fn new(self_id: &'a str, known: &'a [UserProfile]) -> Self {
        Self { self_id, known }
    }

    /// "You" for the local user, the username if known, else the raw id
    pub fn name(&self, user_id: &str) -> String {
        if user_id == self.self_id {
            return "You".to_string();
        }
        self.known
            .iter()
            .find(|u| u.id == user_id)
            .map(|u| u.username.clone())
            .unwrap_or_else(|| user_id.to_string())
    }
}

pub fn render_group_tip(tip: &GroupTip, names: &NameResolver<'_>) -> String {
    let users = tip
        .user_ids
        .iter()
        .map(|id| names.name(id))
        .collect::<Vec<_>>()
        .join(", ");
    let operator = tip.operator_id.as_deref().map(|id| names.name(id)).unwrap_or_default();

    match tip.operation {
        GroupTipOp::MemberJoin => format!("{} joined the group", users),
        GroupTipOp::MemberQuit => format!("{} left the group", users),
        GroupTipOp::MemberKickedOut => format!("{} kicked out by {}", users, operator),
        GroupTipOp::MemberSetAdmin => format!("{} is now Admin", users),
        GroupTipOp::GroupProfileUpdated => "Group profile updated".to_string(),
        _ => "Group Notification".to_string(),
    }
}

/// One-line preview for the conversation list
pub fn summarize(payload: &Payload) -> String {
    match payload {
        Payload::Text { text } => text.clone(),
        Payload::Image(_) => "[Image]".to_string(),
        Payload::File(_) => "[File]".to_string(),
        Payload::GroupInvite(_) => "[Group Invitation]".to_string(),
        Payload::GroupTip(_) => "[Group Notification]".to_string(),
        Payload::Unknown { description } => description.clone(),
    }
}
