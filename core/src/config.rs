/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_SERVER_PORT: u16 = 3000;
const DEFAULT_SIG_EXPIRE_SECS: u64 = 86_400 * 7;

/// Sync engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a typing signal keeps the peer marked as typing
    pub typing_window: Duration,

    /// A peer seen more recently than this is Online even if the transport says otherwise
    pub online_window: Duration,

    /// Native presence poll while a peer conversation is open
    pub presence_poll_interval: Duration,

    /// Minimum gap between two outbound typing signals
    pub typing_throttle: Duration,

    /// Max pending attachments per send
    pub attachment_limit: usize,

    /// Bounded transport event channel
    pub event_channel_capacity: usize,

    /// Bounded dispatcher command channel
    pub command_channel_capacity: usize,

    /// Store change broadcast capacity
    pub store_event_capacity: usize,

    /// Object storage bucket for attachments
    pub attachment_bucket: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            typing_window: Duration::from_millis(3_000),
            online_window: Duration::from_millis(120_000),
            presence_poll_interval: Duration::from_secs(10),
            typing_throttle: Duration::from_millis(2_000),
            attachment_limit: 3,
            event_channel_capacity: 256,
            command_channel_capacity: 64,
            store_event_capacity: 256,
            attachment_bucket: "chat-attachments".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attachment_limit == 0 {
            return Err(ChatError::Config("attachment_limit must be at least 1".to_string()));
        }
        if self.event_channel_capacity == 0 || self.command_channel_capacity == 0 {
            return Err(ChatError::Config("channel capacities must be non-zero".to_string()));
        }
        if self.presence_poll_interval.is_zero() {
            return Err(ChatError::Config("presence_poll_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Credential endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening address
    pub listen_addr: SocketAddr,

    /// Transport application id (0 = unset)
    pub sdk_app_id: u64,

    /// Server-side signing secret (empty = unset)
    pub secret_key: String,

    /// Credential lifetime in seconds
    pub sig_expire_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            sdk_app_id: 0,
            secret_key: String::new(),
            sig_expire_secs: DEFAULT_SIG_EXPIRE_SECS,
        }
    }
}

impl ServerConfig {
    /// Both signing inputs are present
    pub fn is_configured(&self) -> bool {
        self.sdk_app_id != 0 && !self.secret_key.is_empty()
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut port: Option<u16> = None;
        let mut sdk_app_id: Option<u64> = None;
        let mut secret_key: Option<String> = None;
        let mut sig_expire_secs = DEFAULT_SIG_EXPIRE_SECS;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--sdk-app-id" => {
                    let v = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--sdk-app-id requires a value".to_string())
                    })?;
                    sdk_app_id = Some(v.parse::<u64>().map_err(|_| {
                        ChatError::Config("--sdk-app-id must be a number".to_string())
                    })?);
                    i += 2;
                }
                "--secret-key" => {
                    let v = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--secret-key requires a value".to_string())
                    })?;
                    secret_key = Some(v.clone());
                    i += 2;
                }
                "--expire-secs" => {
                    let v = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--expire-secs requires a value".to_string())
                    })?;
                    sig_expire_secs = v.parse::<u64>().map_err(|_| {
                        ChatError::Config("--expire-secs must be a number".to_string())
                    })?;
                    i += 2;
                }
                other => {
                    if port.is_some() {
                        return Err(ChatError::Config(format!("Unexpected argument: {}", other)));
                    }
                    port = Some(other.parse::<u16>().map_err(|_| {
                        ChatError::Config("Port must be a valid number (0-65535)".to_string())
                    })?);
                    i += 1;
                }
            }
        }

        // Env overrides, same names the deployment already uses
        if let Some(p) = std::env::var("PORT").ok().and_then(|s| s.parse::<u16>().ok()) {
            port = Some(p);
        }
        if let Some(id) = std::env::var("TENCENT_SDK_APP_ID")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            sdk_app_id = Some(id);
        }
        if let Ok(key) = std::env::var("TENCENT_SECRET_KEY") {
            secret_key = Some(key);
        }

        Ok(Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(DEFAULT_SERVER_PORT))),
            sdk_app_id: sdk_app_id.unwrap_or(0),
            secret_key: secret_key.unwrap_or_default(),
            sig_expire_secs,
        })
    }
}
