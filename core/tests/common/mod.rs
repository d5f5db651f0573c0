//! In-memory collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use nexuschat_core::attachments::{FileHandle, ObjectStorage};
use nexuschat_core::clock::ManualClock;
use nexuschat_core::config::EngineConfig;
use nexuschat_core::control::{encode_control, ControlAction, CustomElem};
use nexuschat_core::conversation_store::ConversationStore;
use nexuschat_core::credential::{Credential, CredentialSource};
use nexuschat_core::engine::{EngineCommand, SyncEngine};
use nexuschat_core::error::{ChatError, Result};
use nexuschat_core::persistence::{BackendFault, BackendResult, ChangeNotice, ConnectionRow, Persistence};
use nexuschat_core::presence::PresenceTracker;
use nexuschat_core::session::{SessionDeps, SessionState};
use nexuschat_core::transport::{
    FaultResult, GroupMember, ImClient, ImEvent, OutboundElem, OutboundMessage, RawElem, RawMessage,
    RawUserStatus, StatusValue, TransportAdapter, TransportFault,
};
use nexuschat_core::types::{
    ChatEvent, Connection, ConnectionStatus, ConversationKind, Direction, UserProfile,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const ME: &str = "me";
pub const T0: u64 = 1_700_000_000_000;

pub fn profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        username: format!("{}-name", id),
        display_id: Some(format!("#{}", id.to_uppercase())),
        avatar_url: None,
    }
}

pub fn connection(id: &str) -> Connection {
    Connection {
        user: profile(id),
        connection_id: format!("conn-{}", id),
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeImClient {
    sink: Mutex<Option<mpsc::Sender<ImEvent>>>,
    /// Every outbound message, in send order
    pub sent: Mutex<Vec<OutboundMessage>>,
    /// Operation log, in call order
    pub calls: Mutex<Vec<String>>,
    pub fail_sends_to: Mutex<HashSet<String>>,
    pub fail_all_sends: AtomicBool,
    pub history: Mutex<HashMap<String, Vec<RawMessage>>>,
    pub statuses: Mutex<HashMap<String, StatusValue>>,
    pub fail_status: AtomicBool,
    pub login_fault: Mutex<Option<TransportFault>>,
    pub create_group_fault: Mutex<Option<TransportFault>>,
    pub join_fault: Mutex<Option<TransportFault>>,
    pub delete_fault: Mutex<Option<TransportFault>>,
    pub members: Mutex<HashMap<String, Vec<GroupMember>>>,
    pub deleted_messages: Mutex<Vec<(String, Vec<String>)>>,
    pub logged_in: AtomicBool,
    /// When set, every send waits for one notification before answering
    pub send_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, every history fetch waits for one notification
    pub history_gate: Mutex<Option<Arc<Notify>>>,
    next_seq: AtomicU64,
}

impl FakeImClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    /// Deliver an SDK event through the registered sink
    pub async fn emit(&self, event: ImEvent) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            let _ = sink.send(event).await;
        }
    }

    /// Control actions sent to `target`, in order
    pub fn controls_to(&self, target: &str) -> Vec<ControlAction> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.to == target)
            .filter_map(|m| match &m.elem {
                OutboundElem::Custom(c) => serde_json::from_str::<ControlAction>(&c.data).ok(),
                OutboundElem::Text(_) => None,
            })
            .collect()
    }

    pub fn set_status(&self, user_id: &str, status: StatusValue) {
        self.statuses.lock().unwrap().insert(user_id.to_string(), status);
    }
}

fn conversation_id(kind: ConversationKind, target: &str) -> String {
    match kind {
        ConversationKind::C2C => format!("C2C{}", target),
        ConversationKind::Group => format!("GROUP{}", target),
    }
}

#[async_trait]
impl ImClient for FakeImClient {
    fn set_event_sink(&self, sink: mpsc::Sender<ImEvent>) {
        *self.sink.lock().unwrap() = Some(sink);
        self.log("set_event_sink");
    }

    fn clear_event_sink(&self) {
        *self.sink.lock().unwrap() = None;
        self.log("clear_event_sink");
    }

    async fn login(&self, user_id: &str, _user_sig: &str) -> FaultResult<()> {
        self.log(format!("login:{}", user_id));
        if let Some(fault) = self.login_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> FaultResult<()> {
        self.log("logout");
        self.logged_in.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> FaultResult<RawMessage> {
        self.log(format!("send:{}", message.to));
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_all_sends.load(Ordering::SeqCst)
            || self.fail_sends_to.lock().unwrap().contains(&message.to)
        {
            return Err(TransportFault::new(2801, "network unavailable"));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let elem = match &message.elem {
            OutboundElem::Text(text) => RawElem::Text { text: text.clone() },
            OutboundElem::Custom(c) => RawElem::Custom(c.clone()),
        };
        let raw = RawMessage {
            id: Some(format!("srv-{}", seq)),
            legacy_id: Some(format!("legacy-{}", seq)),
            sequence: Some(seq),
            conversation_id: conversation_id(message.kind, &message.to),
            from: ME.to_string(),
            flow: Direction::Out,
            time: 1_700_000_000 + seq as i64,
            is_peer_read: false,
            elem,
        };
        self.sent.lock().unwrap().push(message);
        Ok(raw)
    }

    async fn get_message_list(&self, conversation_id: &str) -> FaultResult<Vec<RawMessage>> {
        self.log(format!("get_message_list:{}", conversation_id));
        let gate = self.history_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_message_read(&self, conversation_id: &str) -> FaultResult<()> {
        self.log(format!("set_message_read:{}", conversation_id));
        Err(TransportFault::new(1, "read receipts unavailable"))
    }

    async fn delete_messages(&self, conversation_id: &str, message_ids: &[String]) -> FaultResult<()> {
        self.log(format!("delete_messages:{}", conversation_id));
        if let Some(fault) = self.delete_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        self.deleted_messages
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), message_ids.to_vec()));
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> FaultResult<()> {
        self.log(format!("delete_conversation:{}", conversation_id));
        Ok(())
    }

    async fn subscribe_user_status(&self, user_ids: &[String]) -> FaultResult<()> {
        self.log(format!("subscribe_user_status:{}", user_ids.join(",")));
        Ok(())
    }

    async fn get_user_status(&self, user_ids: &[String]) -> FaultResult<Vec<RawUserStatus>> {
        self.log(format!("get_user_status:{}", user_ids.join(",")));
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(TransportFault::new(70001, "status query failed"));
        }
        let statuses = self.statuses.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|id| {
                statuses.get(id).map(|s| RawUserStatus {
                    user_id: id.clone(),
                    status_type: Some(s.clone()),
                })
            })
            .collect())
    }

    async fn create_group(&self, name: &str) -> FaultResult<String> {
        self.log(format!("create_group:{}", name));
        if let Some(fault) = self.create_group_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        Ok(format!("@TGS#{}", name.replace(' ', "_")))
    }

    async fn join_group(&self, group_id: &str) -> FaultResult<()> {
        self.log(format!("join_group:{}", group_id));
        match self.join_fault.lock().unwrap().clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    async fn get_group_member_list(&self, group_id: &str) -> FaultResult<Vec<GroupMember>> {
        Ok(self.members.lock().unwrap().get(group_id).cloned().unwrap_or_default())
    }

    async fn get_group_member_profile(&self, group_id: &str, user_ids: &[String]) -> FaultResult<Vec<GroupMember>> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(group_id)
            .map(|list| list.iter().filter(|m| user_ids.contains(&m.user_id)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_group_member(&self, group_id: &str, user_ids: &[String]) -> FaultResult<()> {
        self.log(format!("delete_group_member:{}:{}", group_id, user_ids.join(",")));
        Ok(())
    }

    async fn quit_group(&self, group_id: &str) -> FaultResult<()> {
        self.log(format!("quit_group:{}", group_id));
        Ok(())
    }

    async fn dismiss_group(&self, group_id: &str) -> FaultResult<()> {
        self.log(format!("dismiss_group:{}", group_id));
        Ok(())
    }
}

/// Let detached tasks (pong replies, mark-read) run to completion
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

pub fn raw_text(conversation_id: &str, from: &str, id: &str, text: &str) -> RawMessage {
    RawMessage {
        id: Some(id.to_string()),
        legacy_id: None,
        sequence: None,
        conversation_id: conversation_id.to_string(),
        from: from.to_string(),
        flow: if from == ME { Direction::Out } else { Direction::In },
        time: 1_700_000_000,
        is_peer_read: false,
        elem: RawElem::Text { text: text.to_string() },
    }
}

pub fn raw_control(from: &str, action: ControlAction) -> RawMessage {
    let elem: CustomElem = encode_control(action).unwrap();
    RawMessage {
        id: Some(format!("ctl-{}", from)),
        legacy_id: None,
        sequence: None,
        conversation_id: format!("C2C{}", from),
        from: from.to_string(),
        flow: Direction::In,
        time: 1_700_000_000,
        is_peer_read: false,
        elem: RawElem::Custom(elem),
    }
}

// ─── Persistence ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePersistence {
    pub rows: Mutex<Vec<ConnectionRow>>,
    pub users: Mutex<Vec<UserProfile>>,
    pub fail_delete: AtomicBool,
    pub insert_fault: Mutex<Option<BackendFault>>,
    pub deleted: Mutex<Vec<String>>,
    pub profile_updates: Mutex<Vec<(String, String)>>,
    change_tx: Mutex<Option<mpsc::Sender<ChangeNotice>>>,
    next_id: AtomicU64,
}

impl FakePersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_row(&self, id: &str, sender: &str, receiver: &str, status: ConnectionStatus) {
        self.rows.lock().unwrap().push(ConnectionRow {
            id: id.to_string(),
            sender: profile(sender),
            receiver: profile(receiver),
            status,
        });
    }

    pub fn add_user(&self, id: &str) {
        self.users.lock().unwrap().push(profile(id));
    }

    /// Fire a change notice on the connections feed
    pub async fn notify_change(&self) {
        let tx = self.change_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(ChangeNotice {
                table: "connections".to_string(),
            })
            .await;
        }
    }
}

#[async_trait]
impl Persistence for FakePersistence {
    async fn accepted_connections(&self, user_id: &str) -> BackendResult<Vec<ConnectionRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == ConnectionStatus::Accepted)
            .filter(|r| r.sender.id == user_id || r.receiver.id == user_id)
            .cloned()
            .collect())
    }

    async fn pending_requests(&self, user_id: &str) -> BackendResult<Vec<ConnectionRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == ConnectionStatus::Pending && r.receiver.id == user_id)
            .cloned()
            .collect())
    }

    async fn find_connection_between(&self, a: &str, b: &str) -> BackendResult<Option<ConnectionRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                (r.sender.id == a && r.receiver.id == b) || (r.sender.id == b && r.receiver.id == a)
            })
            .cloned())
    }

    async fn insert_connection(&self, sender_id: &str, receiver_id: &str) -> BackendResult<()> {
        if let Some(fault) = self.insert_fault.lock().unwrap().clone() {
            return Err(fault);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.add_row(&format!("new-{}", n), sender_id, receiver_id, ConnectionStatus::Pending);
        Ok(())
    }

    async fn set_connection_status(&self, connection_id: &str, status: ConnectionStatus) -> BackendResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|r| r.id == connection_id) {
            Some(row) => {
                row.status = status;
                Ok(())
            }
            None => Err(BackendFault::new("row not found")),
        }
    }

    async fn delete_connection(&self, connection_id: &str) -> BackendResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BackendFault::new("permission denied"));
        }
        self.rows.lock().unwrap().retain(|r| r.id != connection_id);
        self.deleted.lock().unwrap().push(connection_id.to_string());
        Ok(())
    }

    async fn find_user_by_display_id(&self, display_id: &str) -> BackendResult<Option<UserProfile>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.display_id.as_deref() == Some(display_id))
            .cloned())
    }

    async fn update_profile(&self, user_id: &str, username: &str, _avatar_url: Option<&str>) -> BackendResult<()> {
        self.profile_updates
            .lock()
            .unwrap()
            .push((user_id.to_string(), username.to_string()));
        Ok(())
    }

    async fn subscribe_connection_changes(&self, _user_id: &str) -> BackendResult<mpsc::Receiver<ChangeNotice>> {
        let (tx, rx) = mpsc::channel(8);
        *self.change_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

// ─── Object storage ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeStorage {
    pub fail_names: Mutex<HashSet<String>>,
    /// File names in upload order, failed attempts included
    pub attempts: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, name: &str) {
        self.fail_names.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(&self, _bucket: &str, _path: &str, file: &FileHandle) -> Result<()> {
        self.attempts.lock().unwrap().push(file.name.clone());
        if self.fail_names.lock().unwrap().contains(&file.name) {
            return Err(ChatError::Transport(format!("upload of {} failed", file.name)));
        }
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("https://storage.test/{}/{}", bucket, path)
    }
}

// ─── Credentials ─────────────────────────────────────────────────────────────

pub struct FakeCredentials {
    pub error: Mutex<Option<String>>,
}

impl FakeCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            error: Mutex::new(None),
        })
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn fetch(&self, _user_id: &str) -> Result<Credential> {
        match self.error.lock().unwrap().clone() {
            Some(message) => Err(ChatError::Auth(message)),
            None => Ok(Credential {
                user_sig: "sig".to_string(),
                sdk_app_id: 1400000001,
            }),
        }
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

/// An engine wired to fakes, driven directly through `handle_event`
pub struct Harness {
    pub engine: SyncEngine,
    pub commands: mpsc::Receiver<EngineCommand>,
    pub events: broadcast::Receiver<ChatEvent>,
    pub im: Arc<FakeImClient>,
    pub persistence: Arc<FakePersistence>,
    pub storage: Arc<FakeStorage>,
    pub clock: ManualClock,
}

impl Harness {
    pub async fn new() -> Self {
        let clock = ManualClock::new(T0);
        let im = FakeImClient::new();
        let persistence = FakePersistence::new();
        let storage = FakeStorage::new();
        let config = EngineConfig::default();

        let (tx, events) = broadcast::channel(1024);
        let state = SessionState::new(tx.clone());
        state.set_user(Some(profile(ME))).await;
        let store = ConversationStore::new(tx.clone());
        let presence = PresenceTracker::new(
            Arc::new(clock.clone()),
            config.typing_window,
            config.online_window,
            tx,
        );
        let (engine, commands) = SyncEngine::new(
            TransportAdapter::new(im.clone()),
            store,
            presence,
            state,
            storage.clone(),
            Arc::new(clock.clone()),
            config,
            CancellationToken::new(),
        );
        Self {
            engine,
            commands,
            events,
            im,
            persistence,
            storage,
            clock,
        }
    }

    pub async fn deliver(&self, messages: Vec<RawMessage>) {
        let event = nexuschat_core::transport::normalize_event(ImEvent::MessageReceived(messages));
        self.engine.handle_event(event).await;
    }

    /// Every notice broadcast so far
    pub fn notices(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ChatEvent::Notice { message, .. } = event {
                out.push(message);
            }
        }
        out
    }
}

pub fn session_deps(
    im: Arc<FakeImClient>,
    persistence: Arc<FakePersistence>,
    credentials: Arc<FakeCredentials>,
    clock: ManualClock,
) -> SessionDeps {
    SessionDeps {
        im,
        persistence,
        storage: FakeStorage::new(),
        credentials,
        clock: Arc::new(clock),
    }
}
