use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use nexuschat_core::credential::{CredentialSource, HttpCredentialSource};
use nexuschat_core::credential_api::{serve, HEALTH_TEXT};
use nexuschat_core::error::ChatError;
use nexuschat_core::ServerConfig;
use tokio::net::TcpListener;

async fn spawn_api(sdk_app_id: u64, secret_key: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        listen_addr: addr,
        sdk_app_id,
        secret_key: secret_key.to_string(),
        sig_expire_secs: 604_800,
    };
    tokio::spawn(serve(listener, config));
    format!("http://{}", addr)
}

async fn request(method: Method, url: &str, body: &'static str) -> (StatusCode, String) {
    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn test_health_check() {
    let base = spawn_api(1400000001, "secret").await;
    let (status, body) = request(Method::GET, &format!("{}/", base), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, HEALTH_TEXT);
}

#[tokio::test]
async fn test_issues_credential_for_user() {
    let base = spawn_api(1400000001, "secret").await;
    let credential = HttpCredentialSource::new(&base).fetch("alice").await.unwrap();
    assert_eq!(credential.sdk_app_id, 1400000001);
    assert!(!credential.user_sig.is_empty());
}

#[tokio::test]
async fn test_missing_user_id_is_bad_request() {
    let base = spawn_api(1400000001, "secret").await;
    let url = format!("{}/api/generate-user-sig", base);

    let (status, body) = request(Method::POST, &url, "{}").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("Missing userId"));

    let err = HttpCredentialSource::new(&base).fetch("").await.unwrap_err();
    assert!(matches!(err, ChatError::Auth(message) if message == "Missing userId"));
}

#[tokio::test]
async fn test_unconfigured_server_reports_missing_keys() {
    let base = spawn_api(0, "").await;
    let err = HttpCredentialSource::new(&base).fetch("alice").await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Auth(message) if message == "Server configuration error (Missing Tencent keys)"
    ));
}

#[tokio::test]
async fn test_preflight_and_unknown_routes() {
    let base = spawn_api(1400000001, "secret").await;
    let (status, _) = request(Method::OPTIONS, &format!("{}/api/generate-user-sig", base), "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = request(Method::GET, &format!("{}/nope", base), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
