/// Session: shared UI-facing state, bootstrap and logout
use crate::attachments::ObjectStorage;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conversation_store::ConversationStore;
use crate::credential::CredentialSource;
use crate::directory::ConnectionDirectory;
use crate::engine::{EngineCommand, SyncEngine};
use crate::error::{ChatError, Result};
use crate::persistence::Persistence;
use crate::presence::PresenceTracker;
use crate::transport::{ImClient, TransportAdapter};
use crate::types::{ChatEvent, Connection, ConnectionRequest, Room, UserProfile};
use crate::workflow::WorkflowOrchestrator;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub user: Option<UserProfile>,
    pub connections: Vec<Connection>,
    pub requests: Vec<ConnectionRequest>,
    pub active_room: Option<Room>,
    pub is_connected: bool,
    pub init_error: Option<String>,
    pub is_group_admin: bool,
}

/// Connections, requests and the active room. Every change is broadcast.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<RwLock<SessionSnapshot>>,
    events: broadcast::Sender<ChatEvent>,
}

impl SessionState {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionSnapshot::default())),
            events,
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().await.clone()
    }

    pub async fn user(&self) -> Option<UserProfile> {
        self.inner.read().await.user.clone()
    }

    pub async fn set_user(&self, user: Option<UserProfile>) {
        self.inner.write().await.user = user;
    }

    /// Local user id, empty before a user is set
    pub async fn self_id(&self) -> String {
        self.inner
            .read()
            .await
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .unwrap_or_default()
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.inner.read().await.connections.clone()
    }

    pub async fn is_connected_to(&self, peer_id: &str) -> bool {
        self.inner
            .read()
            .await
            .connections
            .iter()
            .any(|c| c.user.id == peer_id)
    }

    pub async fn set_connections(&self, connections: Vec<Connection>) {
        self.inner.write().await.connections = connections;
        self.emit(ChatEvent::ConnectionsChanged);
    }

    pub async fn add_connection(&self, connection: Connection) {
        {
            let mut inner = self.inner.write().await;
            if inner.connections.iter().any(|c| c.user.id == connection.user.id) {
                return;
            }
            inner.connections.push(connection);
        }
        self.emit(ChatEvent::ConnectionsChanged);
    }

    pub async fn remove_connection(&self, peer_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let before = inner.connections.len();
            inner.connections.retain(|c| c.user.id != peer_id);
            inner.connections.len() != before
        };
        if removed {
            self.emit(ChatEvent::ConnectionsChanged);
        }
        removed
    }

    pub async fn requests(&self) -> Vec<ConnectionRequest> {
        self.inner.read().await.requests.clone()
    }

    pub async fn set_requests(&self, requests: Vec<ConnectionRequest>) {
        self.inner.write().await.requests = requests;
        self.emit(ChatEvent::RequestsChanged);
    }

    pub async fn remove_request(&self, request_id: &str) -> Option<ConnectionRequest> {
        let removed = {
            let mut inner = self.inner.write().await;
            let pos = inner.requests.iter().position(|r| r.id == request_id)?;
            inner.requests.remove(pos)
        };
        self.emit(ChatEvent::RequestsChanged);
        Some(removed)
    }

    pub async fn active_room(&self) -> Option<Room> {
        self.inner.read().await.active_room.clone()
    }

    pub async fn set_active_room(&self, room: Option<Room>) {
        {
            let mut inner = self.inner.write().await;
            if inner.active_room == room {
                return;
            }
            inner.active_room = room.clone();
        }
        self.emit(ChatEvent::ActiveRoomChanged { room });
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_connected
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.write().await.is_connected = connected;
    }

    pub async fn init_error(&self) -> Option<String> {
        self.inner.read().await.init_error.clone()
    }

    pub async fn set_init_error(&self, error: Option<String>) {
        self.inner.write().await.init_error = error;
    }

    pub async fn is_group_admin(&self) -> bool {
        self.inner.read().await.is_group_admin
    }

    pub async fn set_group_admin(&self, admin: bool) {
        self.inner.write().await.is_group_admin = admin;
    }

    pub async fn reset(&self) {
        *self.inner.write().await = SessionSnapshot::default();
        self.emit(ChatEvent::Reset);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}

/// External collaborators for one session
#[derive(Clone)]
pub struct SessionDeps {
    pub im: Arc<dyn ImClient>,
    pub persistence: Arc<dyn Persistence>,
    pub storage: Arc<dyn ObjectStorage>,
    pub credentials: Arc<dyn CredentialSource>,
    pub clock: Arc<dyn Clock>,
}

/// One authenticated session. `logout` consumes it.
pub struct Session {
    pub engine: SyncEngine,
    pub directory: ConnectionDirectory,
    pub workflow: WorkflowOrchestrator,
    pub state: SessionState,
    user: UserProfile,
    transport: TransportAdapter,
    persistence: Arc<dyn Persistence>,
    credentials: Arc<dyn CredentialSource>,
    config: EngineConfig,
    commands: Mutex<Option<mpsc::Receiver<EngineCommand>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Session {
    /// Wire everything up without touching the network
    pub async fn new(user: UserProfile, deps: SessionDeps, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.store_event_capacity.max(1));
        let state = SessionState::new(events.clone());
        state.set_user(Some(user.clone())).await;

        let store = ConversationStore::new(events.clone());
        let presence = PresenceTracker::new(
            deps.clock.clone(),
            config.typing_window,
            config.online_window,
            events,
        );
        let transport = TransportAdapter::new(deps.im);
        let shutdown = CancellationToken::new();

        let (engine, commands) = SyncEngine::new(
            transport.clone(),
            store,
            presence,
            state.clone(),
            deps.storage,
            deps.clock,
            config.clone(),
            shutdown.child_token(),
        );
        let directory = ConnectionDirectory::new(deps.persistence.clone(), state.clone(), engine.clone());
        let workflow = WorkflowOrchestrator::new(engine.clone(), deps.persistence.clone());

        Ok(Self {
            engine,
            directory,
            workflow,
            state,
            user,
            transport,
            persistence: deps.persistence,
            credentials: deps.credentials,
            config,
            commands: Mutex::new(Some(commands)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// `new` followed by `connect`
    pub async fn start(user: UserProfile, deps: SessionDeps, config: EngineConfig) -> Result<Self> {
        let session = Self::new(user, deps, config).await?;
        session.connect().await?;
        Ok(session)
    }

    /// Fetch a credential, subscribe, log in, then start the background loops.
    /// A failure is recorded as the session's init error.
    pub async fn connect(&self) -> Result<()> {
        if self.state.is_connected().await {
            return Ok(());
        }
        self.state.set_init_error(None).await;

        match self.login().await {
            Ok(()) => {}
            Err(e) => {
                error!("Session init failed: {}", e);
                self.state.set_init_error(Some(e.to_string())).await;
                return Err(e);
            }
        }
        self.state.set_connected(true).await;
        info!("Session connected as {}", self.user.id);

        if let Err(e) = self.directory.refresh().await {
            warn!("Initial connections refresh failed: {}", e);
        }
        self.spawn_change_watcher().await;
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        let credential = self.credentials.fetch(&self.user.id).await?;
        debug!("Fetched credential for app {}", credential.sdk_app_id);

        // the sink must exist before login so no early event is lost
        let stream = self.transport.subscribe(self.config.event_channel_capacity);
        if let Err(e) = self.transport.login(&self.user.id, &credential.user_sig).await {
            self.transport.unsubscribe();
            return Err(e);
        }

        let Some(commands) = self.commands.lock().await.take() else {
            self.transport.unsubscribe();
            return Err(ChatError::ChannelClosed("dispatcher already started".to_string()));
        };

        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.run(stream, commands).await });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn spawn_change_watcher(&self) {
        let mut feed = match self.persistence.subscribe_connection_changes(&self.user.id).await {
            Ok(rx) => rx,
            Err(fault) => {
                warn!("Connections change feed unavailable: {}", fault);
                return;
            }
        };
        let directory = self.directory.clone();
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notice = feed.recv() => match notice {
                        Some(notice) => {
                            debug!("Change on {}, re-fetching connections", notice.table);
                            if let Err(e) = directory.refresh().await {
                                warn!("Connections refresh failed: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        self.tasks.lock().await.push(handle);
    }

    /// Stop every loop and timer, log out, and reset all state to empty
    pub async fn logout(self) {
        info!("Logging out {}", self.user.id);
        self.shutdown.cancel();
        self.engine.close_conversation().await;
        self.transport.unsubscribe();

        for handle in self.tasks.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.transport.logout().await;
        self.engine.reset().await;
        self.state.reset().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.state.subscribe()
    }
}
