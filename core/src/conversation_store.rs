/// Conversation store: per-conversation ordered message lists and metadata
///
/// Readers get `Arc` snapshots of a message list. Every mutation builds a new
/// list and swaps it in, so a snapshot held by the UI never changes under it.
use crate::types::{ChatEvent, ConversationKey, ConversationMeta, Message, MessageId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub messages: Arc<Vec<Message>>,
    pub unread_count: u32,
    pub last_message_summary: Option<String>,
    pub group_name: Option<String>,
}

/// Summary of one conversation thread (for list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub message_count: usize,
    pub unread_count: u32,
    pub last_message_summary: Option<String>,
    pub group_name: Option<String>,
}

#[derive(Clone)]
pub struct ConversationStore {
    conversations: Arc<RwLock<HashMap<ConversationKey, Conversation>>>,
    events: broadcast::Sender<ChatEvent>,
}

fn contains(messages: &[Message], id: &MessageId) -> bool {
    messages.iter().any(|m| m.id.same_as(id))
}

impl ConversationStore {
    pub fn new(events: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn changed(&self, key: &ConversationKey) {
        let _ = self.events.send(ChatEvent::ConversationChanged { key: key.clone() });
    }

    /// De-duplicating insert. Returns false when an entry with the same
    /// identity is already present.
    pub async fn append(&self, key: &ConversationKey, message: Message) -> bool {
        {
            let mut convs = self.conversations.write().await;
            let conv = convs.entry(key.clone()).or_default();
            if contains(&conv.messages, &message.id) {
                debug!("Dropping duplicate message in {}", key);
                return false;
            }
            let mut next = Vec::with_capacity(conv.messages.len() + 1);
            next.extend(conv.messages.iter().cloned());
            next.push(message);
            conv.messages = Arc::new(next);
        }
        self.changed(key);
        true
    }

    /// Replace the list with fetched history. History is de-duplicated.
    /// Entries already held but absent from the history (messages that
    /// arrived while it was being fetched, pending sends) are kept after it
    /// in their original order.
    pub async fn replace_all(&self, key: &ConversationKey, history: Vec<Message>) {
        {
            let mut convs = self.conversations.write().await;
            let conv = convs.entry(key.clone()).or_default();
            let mut next: Vec<Message> = Vec::with_capacity(history.len() + conv.messages.len());
            for msg in history {
                if !contains(&next, &msg.id) {
                    next.push(msg);
                }
            }
            let kept: Vec<Message> = conv
                .messages
                .iter()
                .filter(|m| !contains(&next, &m.id))
                .cloned()
                .collect();
            next.extend(kept);
            conv.messages = Arc::new(next);
        }
        self.changed(key);
    }

    /// Empty the message list. The conversation itself stays.
    pub async fn clear(&self, key: &ConversationKey) {
        {
            let mut convs = self.conversations.write().await;
            convs.entry(key.clone()).or_default().messages = Arc::new(Vec::new());
        }
        self.changed(key);
    }

    /// Remove one entry by identity. Returns whether anything was removed.
    pub async fn remove(&self, key: &ConversationKey, id: &MessageId) -> bool {
        let removed = {
            let mut convs = self.conversations.write().await;
            match convs.get_mut(key) {
                Some(conv) if contains(&conv.messages, id) => {
                    let next: Vec<Message> = conv
                        .messages
                        .iter()
                        .filter(|m| !m.id.same_as(id))
                        .cloned()
                        .collect();
                    conv.messages = Arc::new(next);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.changed(key);
        }
        removed
    }

    /// The peer has read everything in this conversation
    pub async fn mark_peer_read(&self, key: &ConversationKey) {
        {
            let mut convs = self.conversations.write().await;
            let Some(conv) = convs.get_mut(key) else {
                return;
            };
            let next: Vec<Message> = conv
                .messages
                .iter()
                .cloned()
                .map(|mut m| {
                    m.peer_read_ack = true;
                    m
                })
                .collect();
            conv.messages = Arc::new(next);
        }
        self.changed(key);
    }

    /// Local read: unread count drops to zero
    pub async fn mark_read(&self, key: &ConversationKey) {
        {
            let mut convs = self.conversations.write().await;
            convs.entry(key.clone()).or_default().unread_count = 0;
        }
        let _ = self.events.send(ChatEvent::ConversationListChanged);
    }

    /// Replace all conversation metadata with the transport's list. A
    /// conversation missing from the list has no unread count or summary.
    pub async fn update_metadata(&self, list: Vec<ConversationMeta>) {
        {
            let mut convs = self.conversations.write().await;
            for conv in convs.values_mut() {
                conv.unread_count = 0;
                conv.last_message_summary = None;
                conv.group_name = None;
            }
            for meta in list {
                let conv = convs.entry(meta.key).or_default();
                conv.unread_count = meta.unread_count;
                conv.last_message_summary = meta.last_message_summary;
                conv.group_name = meta.group_name;
            }
        }
        let _ = self.events.send(ChatEvent::ConversationListChanged);
    }

    pub async fn messages(&self, key: &ConversationKey) -> Arc<Vec<Message>> {
        let convs = self.conversations.read().await;
        convs
            .get(key)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub async fn conversation(&self, key: &ConversationKey) -> Option<Conversation> {
        self.conversations.read().await.get(key).cloned()
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        let convs = self.conversations.read().await;
        let mut out: Vec<ConversationSummary> = convs
            .iter()
            .map(|(key, c)| ConversationSummary {
                key: key.clone(),
                message_count: c.messages.len(),
                unread_count: c.unread_count,
                last_message_summary: c.last_message_summary.clone(),
                group_name: c.group_name.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        out
    }

    pub async fn unread_count(&self, key: &ConversationKey) -> u32 {
        self.conversations
            .read()
            .await
            .get(key)
            .map(|c| c.unread_count)
            .unwrap_or(0)
    }

    /// Drop everything (logout)
    pub async fn reset(&self) {
        self.conversations.write().await.clear();
    }

    /// Send a non-store event on the shared channel
    pub fn broadcast(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }
}
