/// Error types for the chat sync core
use thiserror::Error;

/// Transport code for "already a member of this group".
pub const GROUP_ALREADY_MEMBER: i64 = 10013;

/// Transport code for "repeated login" on an already-authenticated client.
pub const REPEATED_LOGIN: i64 = 6014;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad or expired credential. Fatal to the session.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Send or fetch failed. The user may retry manually.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport rejected a group operation.
    #[error("Group error {code}: {message}")]
    Group { code: i64, message: String },

    /// Backend CRUD failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Malformed control or custom payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("You can only add up to {limit} files")]
    AttachmentLimit { limit: usize },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl ChatError {
    pub fn group(code: i64, message: impl Into<String>) -> Self {
        ChatError::Group {
            code,
            message: message.into(),
        }
    }

    /// Group rejections that callers treat as a no-op.
    pub fn is_benign(&self) -> bool {
        matches!(self, ChatError::Group { code, .. } if *code == GROUP_ALREADY_MEMBER)
    }

    /// The session cannot continue and the user must re-authenticate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_member_is_benign() {
        assert!(ChatError::group(GROUP_ALREADY_MEMBER, "already in group").is_benign());
        assert!(!ChatError::group(10010, "group not found").is_benign());
        assert!(!ChatError::Transport("timeout".to_string()).is_benign());
    }

    #[test]
    fn test_only_auth_is_fatal() {
        assert!(ChatError::Auth("expired".to_string()).is_fatal());
        assert!(!ChatError::Persistence("row locked".to_string()).is_fatal());
    }
}
