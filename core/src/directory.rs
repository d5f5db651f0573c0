/// Connections directory: accepted connections and incoming requests
use crate::engine::SyncEngine;
use crate::error::Result;
use crate::persistence::{ConnectionRow, Persistence};
use crate::session::SessionState;
use crate::types::{Connection, ConnectionRequest, ConnectionStatus, UserProfile};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of sending a connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Sent(UserProfile),
    /// Display ids look like `#AX12`
    InvalidDisplayId,
    NotFound,
    SelfRequest,
    AlreadyConnected,
    AlreadySent,
    /// The other user already sent us a request
    IncomingPending,
}

#[derive(Clone)]
pub struct ConnectionDirectory {
    persistence: Arc<dyn Persistence>,
    state: SessionState,
    engine: SyncEngine,
}

/// The other side of each accepted row, first occurrence per user wins
fn connections_of(user_id: &str, rows: &[ConnectionRow]) -> Vec<Connection> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| {
            let other = row.other(user_id);
            seen.insert(other.id.clone()).then(|| Connection {
                user: other.clone(),
                connection_id: row.id.clone(),
            })
        })
        .collect()
}

impl ConnectionDirectory {
    pub fn new(persistence: Arc<dyn Persistence>, state: SessionState, engine: SyncEngine) -> Self {
        Self {
            persistence,
            state,
            engine,
        }
    }

    /// Full re-fetch of connections and requests
    pub async fn refresh(&self) -> Result<()> {
        let user_id = self.state.self_id().await;

        let rows = self.persistence.accepted_connections(&user_id).await?;
        let connections = connections_of(&user_id, &rows);
        debug!("Loaded {} connection(s)", connections.len());
        self.state.set_connections(connections).await;

        if let Some(room) = self.state.active_room().await {
            if room.key.is_peer() && !self.state.is_connected_to(room.target()).await {
                info!("Active peer {} is no longer connected, closing view", room.target());
                self.engine.close_conversation().await;
            }
        }

        let pending = self.persistence.pending_requests(&user_id).await?;
        let requests = pending
            .into_iter()
            .map(|row| ConnectionRequest {
                id: row.id,
                sender: row.sender,
            })
            .collect();
        self.state.set_requests(requests).await;
        Ok(())
    }

    pub async fn accept_request(&self, request_id: &str) -> Result<()> {
        self.persistence
            .set_connection_status(request_id, ConnectionStatus::Accepted)
            .await?;
        if let Some(request) = self.state.remove_request(request_id).await {
            self.state
                .add_connection(Connection {
                    user: request.sender,
                    connection_id: request_id.to_string(),
                })
                .await;
        }
        Ok(())
    }

    pub async fn reject_request(&self, request_id: &str) -> Result<()> {
        self.persistence.delete_connection(request_id).await?;
        self.state.remove_request(request_id).await;
        Ok(())
    }

    /// Look the user up by display id and send them a request
    pub async fn send_request(&self, display_id: &str) -> Result<RequestOutcome> {
        let display_id = display_id.trim();
        if !display_id.starts_with('#') {
            return Ok(RequestOutcome::InvalidDisplayId);
        }
        let self_id = self.state.self_id().await;

        let Some(found) = self.persistence.find_user_by_display_id(display_id).await? else {
            return Ok(RequestOutcome::NotFound);
        };
        if found.id == self_id {
            return Ok(RequestOutcome::SelfRequest);
        }

        if let Some(existing) = self.persistence.find_connection_between(&self_id, &found.id).await? {
            return Ok(match existing.status {
                ConnectionStatus::Accepted => RequestOutcome::AlreadyConnected,
                ConnectionStatus::Pending if existing.sender.id == self_id => RequestOutcome::AlreadySent,
                ConnectionStatus::Pending => RequestOutcome::IncomingPending,
            });
        }

        match self.persistence.insert_connection(&self_id, &found.id).await {
            Ok(()) => {
                info!("Connection request sent to {}", found.id);
                Ok(RequestOutcome::Sent(found))
            }
            Err(fault) if fault.is_unique_violation() => Ok(RequestOutcome::AlreadySent),
            Err(fault) => {
                warn!("Sending request to {} failed: {}", found.id, fault);
                Err(fault.into())
            }
        }
    }

    pub async fn update_profile(&self, username: &str, avatar_url: Option<&str>) -> Result<()> {
        let Some(mut user) = self.state.user().await else {
            return Ok(());
        };
        self.persistence
            .update_profile(&user.id, username, avatar_url)
            .await?;
        user.username = username.to_string();
        user.avatar_url = avatar_url.map(str::to_string);
        self.state.set_user(Some(user)).await;
        Ok(())
    }
}
