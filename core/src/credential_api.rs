/// Credential endpoint: exchanges a user id for a transport login credential
///
/// Endpoints:
///   GET  /                          health check
///   POST /api/generate-user-sig     body: {"userId":"..."}
use crate::config::ServerConfig;
use crate::credential::{Credential, UserSigSigner};
use crate::error::Result;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

pub const HEALTH_TEXT: &str = "NexusChat Server Running";

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty() -> BoxBody {
    Full::new(bytes::Bytes::new()).boxed()
}

fn json_resp(status: StatusCode, value: serde_json::Value) -> Resp {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(empty()))
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(status, serde_json::json!({ "error": msg }))
}

fn text_resp(status: StatusCode, text: &'static str) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(bytes::Bytes::from_static(text.as_bytes())).boxed())
        .unwrap_or_else(|_| Response::new(empty()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Bind `config.listen_addr` and serve until the process exits
pub async fn start_credential_api(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("Server running on {}", config.listen_addr);
    if !config.is_configured() {
        warn!("Transport app id or secret key is missing. Real-time features will not work.");
    } else {
        info!("Transport signing configured for app {}", config.sdk_app_id);
    }
    serve(listener, config).await;
    Ok(())
}

/// Accept loop on an already-bound listener
pub async fn serve(listener: TcpListener, config: ServerConfig) {
    let config = Arc::new(config);
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let config = config.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let config = config.clone();
                        async move { Ok::<_, Infallible>(handle(req, config).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        if !e.is_incomplete_message() {
                            error!("Credential API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Credential API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, config: Arc<ServerConfig>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(empty())
            .unwrap_or_else(|_| Response::new(empty()));
    }

    match (method, path.as_str()) {
        (Method::GET, "/") => text_resp(StatusCode::OK, HEALTH_TEXT),
        (Method::POST, "/api/generate-user-sig") => post_generate_user_sig(req, &config).await,
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UserSigRequest {
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}

async fn post_generate_user_sig(req: Request<hyper::body::Incoming>, config: &ServerConfig) -> Resp {
    let body = match req.collect().await {
        Ok(c) => c.to_bytes(),
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let parsed: UserSigRequest = if body.is_empty() {
        UserSigRequest { user_id: None }
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
        }
    };

    let Some(user_id) = parsed.user_id.filter(|id| !id.is_empty()) else {
        return json_err(StatusCode::BAD_REQUEST, "Missing userId");
    };
    if !config.is_configured() {
        return json_err(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error (Missing Tencent keys)",
        );
    }

    let signer = UserSigSigner::new(config.sdk_app_id, config.secret_key.clone());
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    match signer.sign(&user_id, config.sig_expire_secs, now) {
        Ok(user_sig) => {
            let credential = Credential {
                user_sig,
                sdk_app_id: config.sdk_app_id,
            };
            json_resp(
                StatusCode::OK,
                serde_json::to_value(&credential).unwrap_or_default(),
            )
        }
        Err(e) => {
            error!("Error generating UserSig: {}", e);
            json_err(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate UserSig")
        }
    }
}
