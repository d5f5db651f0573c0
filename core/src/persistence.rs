/// Relational backend seam: users and connections rows, change feed
use crate::error::ChatError;
use crate::types::{ConnectionStatus, UserProfile};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Postgres unique-violation code as surfaced by the backend
pub const UNIQUE_VIOLATION: &str = "23505";

/// Failure reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFault {
    pub code: Option<String>,
    pub message: String,
}

impl BackendFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }
}

impl std::fmt::Display for BackendFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<BackendFault> for ChatError {
    fn from(fault: BackendFault) -> Self {
        ChatError::Persistence(fault.to_string())
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendFault>;

/// One `connections` row with both user profiles joined in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub id: String,
    pub sender: UserProfile,
    pub receiver: UserProfile,
    pub status: ConnectionStatus,
}

impl ConnectionRow {
    /// The side of the row that is not `user_id`
    pub fn other(&self, user_id: &str) -> &UserProfile {
        if self.sender.id == user_id {
            &self.receiver
        } else {
            &self.sender
        }
    }
}

/// Realtime change notice on `connections`. Only used to trigger a re-fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub table: String,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Accepted rows where the user is sender or receiver
    async fn accepted_connections(&self, user_id: &str) -> BackendResult<Vec<ConnectionRow>>;

    /// Pending rows received by the user
    async fn pending_requests(&self, user_id: &str) -> BackendResult<Vec<ConnectionRow>>;

    /// Any row between the two users, in either direction
    async fn find_connection_between(&self, a: &str, b: &str) -> BackendResult<Option<ConnectionRow>>;

    async fn insert_connection(&self, sender_id: &str, receiver_id: &str) -> BackendResult<()>;

    async fn set_connection_status(&self, connection_id: &str, status: ConnectionStatus) -> BackendResult<()>;

    async fn delete_connection(&self, connection_id: &str) -> BackendResult<()>;

    async fn find_user_by_display_id(&self, display_id: &str) -> BackendResult<Option<UserProfile>>;

    async fn update_profile(&self, user_id: &str, username: &str, avatar_url: Option<&str>) -> BackendResult<()>;

    /// Change feed on `connections`. Dropping the receiver unsubscribes.
    async fn subscribe_connection_changes(&self, user_id: &str) -> BackendResult<mpsc::Receiver<ChangeNotice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_maps_to_persistence_error() {
        let fault = BackendFault::with_code(UNIQUE_VIOLATION, "duplicate key");
        assert!(fault.is_unique_violation());
        let err: ChatError = fault.into();
        assert!(matches!(err, ChatError::Persistence(m) if m == "duplicate key (23505)"));
        assert!(!BackendFault::new("timeout").is_unique_violation());
    }
}
