/// Multi-step workflows across the transport and the persistence backend
///
/// Steps already performed are never rolled back. A workflow that fails part
/// way raises one notice and leaves whatever it completed in place.
use crate::control::{self, ControlAction};
use crate::engine::SyncEngine;
use crate::error::{ChatError, Result};
use crate::persistence::Persistence;
use crate::types::{ConversationKey, GroupInvite, Message, NoticeLevel};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of create-group-and-invite
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCreation {
    pub group_id: String,
    pub invited: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Clone)]
pub struct WorkflowOrchestrator {
    engine: SyncEngine,
    persistence: Arc<dyn Persistence>,
}

impl WorkflowOrchestrator {
    pub fn new(engine: SyncEngine, persistence: Arc<dyn Persistence>) -> Self {
        Self { engine, persistence }
    }

    /// Create the group, then invite every member independently. The group
    /// stays even if some invites fail.
    pub async fn create_group_and_invite(&self, name: &str, member_ids: &[String]) -> Result<GroupCreation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::group(0, "Group name is required"));
        }
        let group_id = match self.engine.transport().create_group(name).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to create group {}: {}", name, e);
                self.engine
                    .notice(NoticeLevel::Error, format!("Failed to create group: {}", e));
                return Err(e);
            }
        };
        info!("Created group {} ({})", name, group_id);

        let (invited, failed) = self.send_invites(&group_id, name, member_ids).await;
        Ok(GroupCreation {
            group_id,
            invited,
            failed,
        })
    }

    /// Invite connections to an existing group, skipping current members
    pub async fn invite_members(
        &self,
        group_id: &str,
        group_name: &str,
        user_ids: &[String],
    ) -> Result<GroupCreation> {
        let members: HashSet<String> = self
            .engine
            .transport()
            .group_members(group_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        let fresh: Vec<String> = user_ids
            .iter()
            .filter(|id| !members.contains(*id))
            .cloned()
            .collect();

        let (invited, failed) = self.send_invites(group_id, group_name, &fresh).await;
        Ok(GroupCreation {
            group_id: group_id.to_string(),
            invited,
            failed,
        })
    }

    /// All-settled invite fan-out. Each sent invite also lands in the
    /// inviter's own view of that one-to-one conversation.
    async fn send_invites(
        &self,
        group_id: &str,
        group_name: &str,
        member_ids: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let inviter_name = self
            .engine
            .state()
            .user()
            .await
            .map(|u| u.username)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Admin".to_string());
        let invite = GroupInvite {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            inviter_name,
        };

        let sends = member_ids.iter().map(|member| {
            let invite = &invite;
            async move {
                let key = ConversationKey::c2c(member.clone());
                let sent: Result<Message> = match control::encode_invite(invite) {
                    Ok(elem) => self.engine.transport().send_custom(&key, elem).await,
                    Err(e) => Err(e),
                };
                (member.clone(), key, sent)
            }
        });

        let mut invited = Vec::new();
        let mut failed = Vec::new();
        for (member, key, sent) in join_all(sends).await {
            match sent {
                Ok(message) => {
                    self.engine.store().append(&key, message).await;
                    invited.push(member);
                }
                Err(e) => {
                    warn!("Invite to {} for group {} failed: {}", member, group_id, e);
                    failed.push(member);
                }
            }
        }

        if !failed.is_empty() {
            self.engine.notice(
                NoticeLevel::Error,
                format!("Failed to invite {} member(s): {}", failed.len(), failed.join(", ")),
            );
        }
        (invited, failed)
    }

    /// Accept a group invite. Being a member already is not an error.
    pub async fn join_group_from_invite(&self, invite: &GroupInvite) -> Result<JoinOutcome> {
        match self.engine.transport().join_group(&invite.group_id).await {
            Ok(()) => {
                self.engine.notice(
                    NoticeLevel::Info,
                    format!("Joined group {} successfully!", invite.group_name),
                );
                Ok(JoinOutcome::Joined)
            }
            Err(e) if e.is_benign() => {
                self.engine
                    .notice(NoticeLevel::Info, "You are already a member of this group.");
                Ok(JoinOutcome::AlreadyMember)
            }
            Err(e) => {
                self.engine
                    .notice(NoticeLevel::Error, format!("Failed to join group: {}", e));
                Err(e)
            }
        }
    }

    /// Signal the peer, delete the backend row, tear down the conversation,
    /// then drop the peer locally. Only the backend delete can abort.
    pub async fn remove_connection(&self, connection_id: &str, peer_id: &str) -> Result<()> {
        let key = ConversationKey::c2c(peer_id);
        let transport = self.engine.transport();

        if let Err(e) = transport.send_control(&key, ControlAction::ConnectionRemoved).await {
            warn!("connection_removed signal to {} failed: {}", peer_id, e);
        }

        if let Err(fault) = self.persistence.delete_connection(connection_id).await {
            warn!("Deleting connection {} failed: {}", connection_id, fault);
            self.engine.notice(NoticeLevel::Error, "Failed to remove connection");
            return Err(fault.into());
        }

        if let Err(e) = transport.delete_conversation(&key).await {
            warn!("Deleting conversation {} failed: {}", key, e);
        }
        self.engine.store().clear(&key).await;

        self.engine.state().remove_connection(peer_id).await;
        if self.engine.state().active_room().await.map(|r| r.key) == Some(key) {
            self.engine.close_conversation().await;
        }
        info!("Removed connection {} with {}", connection_id, peer_id);
        Ok(())
    }

    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.engine
            .transport()
            .remove_group_member(group_id, user_id)
            .await
            .map_err(|e| self.surface("Failed to remove member", e))
    }

    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        self.engine
            .transport()
            .leave_group(group_id)
            .await
            .map_err(|e| self.surface("Failed to leave group", e))?;
        self.close_if_active(group_id).await;
        Ok(())
    }

    pub async fn dismiss_group(&self, group_id: &str) -> Result<()> {
        self.engine
            .transport()
            .dismiss_group(group_id)
            .await
            .map_err(|e| self.surface("Failed to dismiss group", e))?;
        self.close_if_active(group_id).await;
        Ok(())
    }

    fn surface(&self, what: &str, e: ChatError) -> ChatError {
        warn!("{}: {}", what, e);
        self.engine.notice(NoticeLevel::Error, format!("{}: {}", what, e));
        e
    }

    async fn close_if_active(&self, group_id: &str) {
        let key = ConversationKey::group(group_id);
        if self.engine.state().active_room().await.map(|r| r.key) == Some(key) {
            self.engine.close_conversation().await;
        }
    }
}
