/// Synchronization engine
///
/// One dispatcher loop consumes the transport's ordered event stream and the
/// engine's own command channel (timer expiries, poll results), and is the
/// only place inbound events touch the stores. The outbound send path runs on
/// the caller's task and may interleave with it; identity-based
/// de-duplication in the store keeps the two consistent.
use crate::attachments::{
    self, AddOutcome, FileHandle, MoveDirection, ObjectStorage, PendingAttachment, PendingAttachments,
};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::control::{self, ControlAction, Inbound};
use crate::conversation_store::ConversationStore;
use crate::error::{ChatError, Result};
use crate::presence::{NativeStatus, PresenceStatus, PresenceTracker};
use crate::session::SessionState;
use crate::transport::{EventStream, GroupRole, TransportAdapter, TransportEvent};
use crate::types::{ChatEvent, ConversationKey, Direction, LocalId, Message, MessageId, NoticeLevel, Room};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work the engine schedules for its own dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// A typing reset timer fired
    TypingExpired { peer_id: String },
    /// A native presence poll came back
    NativeStatus { peer_id: String, status: NativeStatus },
}

/// Per-send result of an attachment batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentReport {
    pub sent: Vec<Message>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct SyncEngine {
    transport: TransportAdapter,
    store: ConversationStore,
    presence: PresenceTracker,
    state: SessionState,
    storage: Arc<dyn ObjectStorage>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    commands: mpsc::Sender<EngineCommand>,
    attachments: Arc<Mutex<PendingAttachments>>,
    poll: Arc<Mutex<Option<CancellationToken>>>,
    last_typing_sent: Arc<Mutex<Option<u64>>>,
    next_local_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: TransportAdapter,
        store: ConversationStore,
        presence: PresenceTracker,
        state: SessionState,
        storage: Arc<dyn ObjectStorage>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<EngineCommand>) {
        let (tx, rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let engine = Self {
            transport,
            store,
            presence,
            state,
            storage,
            clock,
            attachments: Arc::new(Mutex::new(PendingAttachments::new(config.attachment_limit))),
            config: Arc::new(config),
            commands: tx,
            poll: Arc::new(Mutex::new(None)),
            last_typing_sent: Arc::new(Mutex::new(None)),
            next_local_id: Arc::new(AtomicU64::new(1)),
            shutdown,
        };
        (engine, rx)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transport(&self) -> &TransportAdapter {
        &self.transport
    }

    /// One user-facing notification
    pub(crate) fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.store.broadcast(ChatEvent::Notice {
            level,
            message: message.into(),
        });
    }

    fn now_seconds(&self) -> i64 {
        (self.clock.now_millis() / 1000) as i64
    }

    // ─── Dispatcher ──────────────────────────────────────────────────────────

    /// Process transport events and engine commands one at a time, in
    /// arrival order, until shutdown or until the transport drops the sink.
    pub async fn run(self, mut events: EventStream, mut commands: mpsc::Receiver<EngineCommand>) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("Transport event sink closed");
                        break;
                    }
                },
                Some(command) = commands.recv() => self.handle_command(command).await,
            }
        }
        info!("Dispatcher stopped");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessagesReceived(batch) => {
                for inbound in batch {
                    self.handle_inbound(inbound).await;
                }
            }
            TransportEvent::ConversationListUpdated(list) => self.store.update_metadata(list).await,
            TransportEvent::ReadByPeer(keys) => {
                for key in keys {
                    self.store.mark_peer_read(&key).await;
                }
            }
            TransportEvent::StatusUpdated(list) => {
                for (peer_id, native) in list {
                    self.presence.evaluate(&peer_id, native).await;
                }
            }
            TransportEvent::Error { code, message } => {
                warn!("Transport error event {}: {}", code, message);
            }
        }
    }

    pub async fn handle_command(&self, command: EngineCommand) {
        match command {
            EngineCommand::TypingExpired { peer_id } => {
                self.presence.expire_typing(&peer_id).await;
            }
            EngineCommand::NativeStatus { peer_id, status } => {
                self.presence.evaluate(&peer_id, status).await;
            }
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Control { action, from, .. } => self.handle_control(action, &from).await,
            Inbound::Content(message) => self.handle_content(message).await,
        }
    }

    async fn handle_content(&self, message: Message) {
        let key = message.conversation.clone();
        let sender = message.sender_id.clone();
        let incoming = message.direction == Direction::In;

        if !self.store.append(&key, message).await {
            return;
        }
        if incoming {
            // any message counts as activity
            self.presence.touch(&sender).await;
        }
        let active = self.state.active_room().await.map(|r| r.key);
        if active.as_ref() == Some(&key) {
            let transport = self.transport.clone();
            tokio::spawn(async move { transport.mark_read(&key).await });
        }
    }

    async fn handle_control(&self, action: ControlAction, from: &str) {
        if from == self.state.self_id().await {
            return;
        }
        match action {
            ControlAction::Typing => {
                let after = self.presence.set_typing(from).await;
                self.schedule_typing_expiry(from.to_string(), after);
            }
            ControlAction::Ping => {
                self.presence.touch(from).await;
                self.spawn_pong(from.to_string());
            }
            ControlAction::Pong => self.presence.touch(from).await,
            ControlAction::ConnectionRemoved => self.handle_connection_removed(from).await,
        }
    }

    /// Reply off the dispatcher so a slow send cannot stall inbound events
    fn spawn_pong(&self, peer_id: String) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let key = ConversationKey::c2c(peer_id.as_str());
            if let Err(e) = transport.send_control(&key, ControlAction::Pong).await {
                warn!("Pong to {} failed: {}", peer_id, e);
            }
        });
    }

    fn schedule_typing_expiry(&self, peer_id: String, after: Duration) {
        let commands = self.commands.clone();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = commands.send(EngineCommand::TypingExpired { peer_id }).await;
                }
            }
        });
    }

    /// The peer removed the connection on their side
    pub async fn handle_connection_removed(&self, peer_id: &str) {
        info!("Connection removed by remote user {}", peer_id);
        let key = ConversationKey::c2c(peer_id);

        self.state.remove_connection(peer_id).await;
        if self.state.active_room().await.map(|r| r.key) == Some(key.clone()) {
            self.close_conversation().await;
        }
        if let Err(e) = self.transport.delete_conversation(&key).await {
            warn!("Deleting conversation {} failed: {}", key, e);
        }
        self.store.clear(&key).await;
    }

    // ─── Conversations ───────────────────────────────────────────────────────

    /// Make `room` the single active room: load history, mark it read and,
    /// for a peer room, start the presence protocol.
    pub async fn open_conversation(&self, room: Room) -> Result<()> {
        self.stop_presence_poll().await;
        let key = room.key.clone();
        self.state.set_active_room(Some(room)).await;

        let history = self.transport.fetch_history(&key).await;
        match &history {
            Ok(messages) => self.store.replace_all(&key, messages.clone()).await,
            Err(e) => {
                warn!("Loading history for {} failed: {}", key, e);
                self.notice(NoticeLevel::Error, "Failed to load messages");
            }
        }
        self.store.mark_read(&key).await;
        self.transport.mark_read(&key).await;

        if key.is_peer() {
            self.state.set_group_admin(false).await;
            let peer = key.target.clone();
            self.transport.subscribe_presence(&[peer.clone()]).await;
            if let Err(e) = self.transport.send_control(&key, ControlAction::Ping).await {
                warn!("Ping to {} failed: {}", peer, e);
            }
            self.refresh_presence(&peer).await;
            self.start_presence_poll(peer).await;
        } else {
            let admin = self.resolve_group_admin(&key.target).await;
            self.state.set_group_admin(admin).await;
        }

        history.map(|_| ())
    }

    async fn resolve_group_admin(&self, group_id: &str) -> bool {
        let self_id = self.state.self_id().await;
        match self.transport.group_member_profile(group_id, &self_id).await {
            Ok(Some(member)) => matches!(member.role, GroupRole::Owner | GroupRole::Admin),
            Ok(None) => false,
            Err(e) => {
                debug!("Group role lookup for {} failed: {}", group_id, e);
                false
            }
        }
    }

    pub async fn close_conversation(&self) {
        self.stop_presence_poll().await;
        self.state.set_active_room(None).await;
        self.state.set_group_admin(false).await;
    }

    // ─── Presence ────────────────────────────────────────────────────────────

    /// One native status query, folded through the shared status rule
    pub async fn refresh_presence(&self, peer_id: &str) -> PresenceStatus {
        let native = self
            .transport
            .get_presence(&[peer_id.to_string()])
            .await
            .into_iter()
            .find(|(id, _)| id == peer_id)
            .map(|(_, status)| status)
            .unwrap_or(NativeStatus::Unknown);
        self.presence.evaluate(peer_id, native).await
    }

    async fn start_presence_poll(&self, peer_id: String) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.poll.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let transport = self.transport.clone();
        let commands = self.commands.clone();
        let period = self.config.presence_poll_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for (peer_id, status) in transport.get_presence(&[peer_id.clone()]).await {
                            if commands.send(EngineCommand::NativeStatus { peer_id, status }).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Presence poll for {} stopped", peer_id);
        });
    }

    async fn stop_presence_poll(&self) {
        if let Some(token) = self.poll.lock().await.take() {
            token.cancel();
        }
    }

    /// Tell the active room we are typing, at most once per throttle window
    pub async fn notify_typing(&self) {
        let Some(room) = self.state.active_room().await else {
            return;
        };
        let now = self.clock.now_millis();
        let throttle = u64::try_from(self.config.typing_throttle.as_millis()).unwrap_or(u64::MAX);
        {
            let mut last = self.last_typing_sent.lock().await;
            if matches!(*last, Some(at) if now.saturating_sub(at) < throttle) {
                return;
            }
            *last = Some(now);
        }
        if let Err(e) = self.transport.send_control(&room.key, ControlAction::Typing).await {
            debug!("Typing signal to {} failed: {}", room.key, e);
        }
    }

    // ─── Outbound ────────────────────────────────────────────────────────────

    /// Optimistic text send. The pending entry shows at once; on success the
    /// confirmed message is appended before the pending one is removed, on
    /// failure the pending one is removed and a notice is raised.
    pub async fn send_text(&self, key: &ConversationKey, text: &str) -> Result<Option<Message>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let local_id = LocalId(self.next_local_id.fetch_add(1, Ordering::Relaxed));
        let self_id = self.state.self_id().await;
        let optimistic = Message::optimistic_text(local_id, key.clone(), self_id, text, self.now_seconds());
        let pending_id = optimistic.id.clone();
        self.store.append(key, optimistic).await;
        debug!("Sending {} to {}", local_id, key);

        match self.transport.send_text(key, text).await {
            Ok(confirmed) => {
                self.store.append(key, confirmed.clone()).await;
                self.store.remove(key, &pending_id).await;
                Ok(Some(confirmed))
            }
            Err(e) => {
                warn!("Send to {} failed: {}", key, e);
                self.store.remove(key, &pending_id).await;
                self.notice(NoticeLevel::Error, "Failed to send message");
                Err(e)
            }
        }
    }

    pub async fn add_attachments(&self, files: Vec<FileHandle>) -> Result<AddOutcome> {
        let result = self.attachments.lock().await.add(files);
        match &result {
            Err(e @ ChatError::AttachmentLimit { .. }) => self.notice(NoticeLevel::Error, e.to_string()),
            Ok(outcome) if outcome.dropped_over_limit > 0 => self.notice(
                NoticeLevel::Error,
                format!("Limit reached. Only {} file(s) added.", outcome.added),
            ),
            _ => {}
        }
        result
    }

    pub async fn remove_attachment(&self, id: Uuid) -> bool {
        self.attachments.lock().await.remove(id)
    }

    pub async fn move_attachment(&self, index: usize, direction: MoveDirection) {
        self.attachments.lock().await.move_item(index, direction);
    }

    pub async fn pending_attachments(&self) -> Vec<PendingAttachment> {
        self.attachments.lock().await.items().to_vec()
    }

    pub async fn discard_attachments(&self) {
        self.attachments.lock().await.clear();
    }

    /// Upload and send every queued attachment, one after another. A failed
    /// item is logged and skipped. The queue is empty afterwards either way.
    pub async fn send_attachments(&self, key: &ConversationKey) -> AttachmentReport {
        let queued = self.attachments.lock().await.take();
        let mut report = AttachmentReport::default();

        for item in queued {
            match self.send_attachment(key, &item.file).await {
                Ok(message) => {
                    self.store.append(key, message.clone()).await;
                    report.sent.push(message);
                }
                Err(e) => {
                    warn!("File processing failed for {}: {}", item.file.name, e);
                    report.failed.push(item.file.name);
                }
            }
        }
        report
    }

    async fn send_attachment(&self, key: &ConversationKey, file: &FileHandle) -> Result<Message> {
        let attachment = attachments::upload_attachment(
            self.storage.as_ref(),
            &self.config.attachment_bucket,
            file,
            self.clock.now_millis(),
        )
        .await?;
        let elem = control::encode_attachment(&attachment, file.is_image())?;
        self.transport.send_custom(key, elem).await
    }

    /// Composer submit: queued attachments first, then the text
    pub async fn submit(&self, key: &ConversationKey, text: &str) -> Result<(AttachmentReport, Option<Message>)> {
        let report = self.send_attachments(key).await;
        let sent = self.send_text(key, text).await?;
        Ok((report, sent))
    }

    // ─── Local edits ─────────────────────────────────────────────────────────

    /// Pending entries are dropped locally. Confirmed ones are deleted at the
    /// transport first and stay if that fails.
    pub async fn delete_message(&self, key: &ConversationKey, id: &MessageId) -> Result<()> {
        if let MessageId::Confirmed(server) = id {
            let primary = server
                .primary()
                .ok_or_else(|| ChatError::Protocol("message has no server id".to_string()))?;
            if let Err(e) = self.transport.delete_messages(key, &[primary.to_string()]).await {
                self.notice(NoticeLevel::Error, "Failed to delete message");
                return Err(e);
            }
        }
        self.store.remove(key, id).await;
        Ok(())
    }

    /// Delete every confirmed message at the transport, then empty the list
    pub async fn clear_conversation(&self, key: &ConversationKey) -> Result<()> {
        let messages = self.store.messages(key).await;
        if messages.is_empty() {
            return Ok(());
        }
        let server_ids: Vec<String> = messages
            .iter()
            .filter_map(|m| match &m.id {
                MessageId::Confirmed(server) => server.primary().map(str::to_string),
                MessageId::Pending { .. } => None,
            })
            .collect();
        if !server_ids.is_empty() {
            if let Err(e) = self.transport.delete_messages(key, &server_ids).await {
                self.notice(NoticeLevel::Error, "Failed to clear chat");
                return Err(e);
            }
        }
        self.store.clear(key).await;
        Ok(())
    }

    /// Drop all conversation, presence and composer state
    pub async fn reset(&self) {
        self.stop_presence_poll().await;
        self.store.reset().await;
        self.presence.reset().await;
        self.attachments.lock().await.clear();
        *self.last_typing_sent.lock().await = None;
    }
}
