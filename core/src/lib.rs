/// NexusChat sync core
///
/// Conversation synchronization and presence engine layered over an external
/// IM transport and a relational persistence backend, plus the small
/// credential endpoint the client logs in with.

pub mod error;
pub mod config;
pub mod clock;
pub mod types;
pub mod control;
pub mod transport;
pub mod conversation_store;
pub mod presence;
pub mod attachments;
pub mod persistence;
pub mod render;
pub mod engine;
pub mod workflow;
pub mod directory;
pub mod session;
pub mod credential;
pub mod credential_api;
pub mod calls;

pub use config::{EngineConfig, ServerConfig};
pub use engine::SyncEngine;
pub use error::{ChatError, Result};
pub use session::{Session, SessionDeps, SessionState};
pub use types::{ChatEvent, ConversationKey, Message, MessageId, Room};
