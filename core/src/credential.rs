/// Transport login credentials: server-side signing and the client fetch
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::Write;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// What the client needs to log in to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub user_sig: String,
    pub sdk_app_id: u64,
}

/// Signs per-user transport credentials with the application secret
pub struct UserSigSigner {
    sdk_app_id: u64,
    secret_key: String,
}

#[derive(Serialize)]
struct SigDocument<'a> {
    #[serde(rename = "TLS.ver")]
    version: &'a str,
    #[serde(rename = "TLS.identifier")]
    identifier: &'a str,
    #[serde(rename = "TLS.sdkappid")]
    sdk_app_id: u64,
    #[serde(rename = "TLS.expire")]
    expire: u64,
    #[serde(rename = "TLS.time")]
    time: u64,
    #[serde(rename = "TLS.sig")]
    sig: String,
}

/// Base64 variant the transport expects: `+/=` become `*-_`
fn escape_base64(encoded: &str) -> String {
    encoded
        .chars()
        .map(|c| match c {
            '+' => '*',
            '/' => '-',
            '=' => '_',
            other => other,
        })
        .collect()
}

impl UserSigSigner {
    pub fn new(sdk_app_id: u64, secret_key: impl Into<String>) -> Self {
        Self {
            sdk_app_id,
            secret_key: secret_key.into(),
        }
    }

    fn hmac(&self, identifier: &str, time: u64, expire: u64) -> Result<String> {
        let content = format!(
            "TLS.identifier:{}\nTLS.sdkappid:{}\nTLS.time:{}\nTLS.expire:{}\n",
            identifier, self.sdk_app_id, time, expire
        );
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ChatError::Config(format!("invalid secret key: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Credential for `identifier`, valid `expire_secs` from `now_secs`
    pub fn sign(&self, identifier: &str, expire_secs: u64, now_secs: u64) -> Result<String> {
        let doc = SigDocument {
            version: "2.0",
            identifier,
            sdk_app_id: self.sdk_app_id,
            expire: expire_secs,
            time: now_secs,
            sig: self.hmac(identifier, now_secs, expire_secs)?,
        };
        let json = serde_json::to_vec(&doc)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(escape_base64(&STANDARD.encode(compressed)))
    }
}

/// Where a session gets its transport credential from
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<Credential>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Fetches credentials from the credential endpoint over HTTP
pub struct HttpCredentialSource {
    endpoint: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpCredentialSource {
    /// `base_url` like `http://127.0.0.1:3000`
    pub fn new(base_url: &str) -> Self {
        Self {
            endpoint: format!("{}/api/generate-user-sig", base_url.trim_end_matches('/')),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, user_id: &str) -> Result<Credential> {
        let body = serde_json::to_vec(&serde_json::json!({ "userId": user_id }))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ChatError::Auth(format!("bad credential request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ChatError::Auth(format!("Failed to fetch UserSig: {}", e)))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Auth(format!("Failed to fetch UserSig: {}", e)))?
            .to_bytes();
        debug!("Credential endpoint answered {}", status);

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&bytes)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| "Failed to fetch UserSig".to_string());
            return Err(ChatError::Auth(message));
        }
        serde_json::from_slice(&bytes).map_err(|e| ChatError::Auth(format!("bad credential response: {}", e)))
    }
}
