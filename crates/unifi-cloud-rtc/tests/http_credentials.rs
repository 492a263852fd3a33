use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use unifi_cloud_rtc::credentials::{CredentialFetcher, HttpCredentialFetcher, SessionCredential};
use unifi_cloud_rtc::{CloudApi, CloudConfig, ErrorKind, WebRtcEngine, WebSocketConnector};

const TOKEN: &str = "tok-7f3a";

#[derive(Default)]
struct Cloud {
    uris: Vec<&'static str>,
    /// `(method, path, cookie)` for every authenticated call.
    calls: Mutex<Vec<(Method, String, Option<String>)>>,
    revoked: Mutex<bool>,
    logins: Mutex<usize>,
}

impl Cloud {
    fn record(&self, method: Method, path: String, headers: &HeaderMap) -> bool {
        let cookie = headers
            .get(COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let authorized = !*self.revoked.lock()
            && cookie
                .as_deref()
                .is_some_and(|cookie| cookie.contains(&format!("UBIC_AUTH={TOKEN}")));
        self.calls.lock().push((method, path, cookie));
        authorized
    }
}

async fn login(State(cloud): State<Arc<Cloud>>, Json(body): Json<Value>) -> impl IntoResponse {
    if body["user"] != "unifi" || body["password"] != "hunter2" {
        return (StatusCode::UNAUTHORIZED, HeaderMap::new(), "bad credentials").into_response();
    }
    *cloud.revoked.lock() = false;
    *cloud.logins.lock() += 1;
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, "tracking=xyz; Path=/".parse().expect("header"));
    headers.append(
        SET_COOKIE,
        format!("UBIC_AUTH={TOKEN}; Path=/; HttpOnly; Secure").parse().expect("header"),
    );
    (StatusCode::OK, headers, Json(json!({ "username": "unifi" }))).into_response()
}

async fn logout(State(cloud): State<Arc<Cloud>>, headers: HeaderMap) -> StatusCode {
    cloud.record(Method::POST, "/sso/logout".into(), &headers);
    *cloud.revoked.lock() = true;
    StatusCode::OK
}

async fn user_self(State(cloud): State<Arc<Cloud>>, headers: HeaderMap) -> impl IntoResponse {
    if !cloud.record(Method::GET, "/sso/user/self".into(), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "username": "unifi", "email": "unifi@example.test" })).into_response()
}

async fn devices(State(cloud): State<Arc<Cloud>>, headers: HeaderMap) -> impl IntoResponse {
    if !cloud.record(Method::GET, "/device/devices".into(), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([{ "id": "dev-1" }, { "id": "dev-2" }])).into_response()
}

async fn delete_device(
    State(cloud): State<Arc<Cloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !cloud.record(Method::DELETE, format!("/device/devices/{id}"), &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    StatusCode::NO_CONTENT
}

async fn turn_creds(
    State(cloud): State<Arc<Cloud>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let device = query.get("username").cloned().unwrap_or_default();
    if !cloud.record(Method::GET, format!("/device/turn/creds?username={device}"), &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "username": format!("1700000000:{device}"),
        "password": "relay-secret",
        "ttl": 3600,
        "uris": cloud.uris,
    }))
    .into_response()
}

async fn spawn_cloud(uris: Vec<&'static str>) -> (CloudConfig, Arc<Cloud>) {
    let cloud = Arc::new(Cloud {
        uris,
        ..Cloud::default()
    });
    let app = Router::new()
        .route("/sso/login", post(login))
        .route("/sso/logout", post(logout))
        .route("/sso/user/self", get(user_self))
        .route("/device/devices", get(devices))
        .route("/device/devices/:id", delete(delete_device))
        .route("/device/turn/creds", get(turn_creds))
        .with_state(Arc::clone(&cloud));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let config = CloudConfig {
        auth_base_url: format!("http://{addr}/sso/"),
        device_base_url: format!("http://{addr}/device"),
        signaling_url: format!("ws://{addr}/events"),
        ..CloudConfig::default()
    }
    .with_credentials("unifi", "hunter2");
    (config, cloud)
}

const RELAY_URIS: [&str; 3] = [
    "stun:stun.example.test:3478",
    "turn:turn.example.test:3478?transport=udp",
    "turn:turn.example.test:3478?transport=tcp",
];

#[tokio::test]
async fn login_folds_cookies_and_fetches_device_credentials() {
    let (config, cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let fetcher = HttpCredentialFetcher::new(&config).expect("client");

    let session = fetcher.authenticate("unifi", "hunter2").await.expect("login");
    assert_eq!(session.token, TOKEN);
    assert_eq!(
        session.credential,
        SessionCredential::Cookie(format!("tracking=xyz; UBIC_AUTH={TOKEN}"))
    );

    let creds = fetcher
        .fetch_turn_credentials(&session, "dev-9")
        .await
        .expect("turn creds");
    assert_eq!(creds.username, "1700000000:dev-9");
    assert_eq!(creds.ttl_seconds, 3600);
    assert_eq!(creds.stun_uri, "stun:stun.example.test:3478");
    assert_eq!(creds.turn_uri, "turn:turn.example.test:3478?transport=udp");

    let calls = cloud.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "/device/turn/creds?username=dev-9");
}

#[tokio::test]
async fn wrong_secret_is_an_auth_error() {
    let (config, _cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let fetcher = HttpCredentialFetcher::new(&config).expect("client");

    let err = fetcher
        .authenticate("unifi", "wrong")
        .await
        .expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn logged_out_session_is_not_reused() {
    let (config, cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let fetcher = HttpCredentialFetcher::new(&config).expect("client");
    let session = fetcher.authenticate("unifi", "hunter2").await.expect("login");

    fetcher.logout(&session).await.expect("logout");
    let calls_after_logout = cloud.calls.lock().len();

    let err = fetcher
        .fetch_turn_credentials(&session, "dev-9")
        .await
        .expect_err("session is gone");
    assert_eq!(err.kind(), ErrorKind::Credential);
    // Rejected locally; nothing reached the device service.
    assert_eq!(cloud.calls.lock().len(), calls_after_logout);
}

#[tokio::test]
async fn missing_turn_uri_is_a_credential_error() {
    let (config, _cloud) = spawn_cloud(vec!["stun:stun.example.test:3478"]).await;
    let fetcher = HttpCredentialFetcher::new(&config).expect("client");
    let session = fetcher.authenticate("unifi", "hunter2").await.expect("login");

    let err = fetcher
        .fetch_turn_credentials(&session, "dev-9")
        .await
        .expect_err("no relay");
    assert_eq!(err.kind(), ErrorKind::Credential);
}

#[tokio::test]
async fn facade_passes_rest_calls_through() {
    let (config, cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let api = CloudApi::new(config).expect("api");

    let me = api.self_info().await.expect("self");
    assert_eq!(me["username"], "unifi");

    let devices = api.devices().await.expect("devices");
    assert_eq!(devices.as_array().map(Vec::len), Some(2));

    let deleted = api.delete_device("dev-2").await.expect("delete");
    assert_eq!(deleted, Value::Null);

    let raw = api.turn_creds("dev-1").await.expect("turn creds");
    assert_eq!(raw["password"], "relay-secret");

    api.logout().await.expect("logout");
    api.logout().await.expect("second logout is a no-op");

    let calls = cloud.calls.lock().clone();
    let summary: Vec<(Method, &str)> = calls
        .iter()
        .map(|(method, path, _)| (method.clone(), path.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Method::GET, "/sso/user/self"),
            (Method::GET, "/device/devices"),
            (Method::DELETE, "/device/devices/dev-2"),
            (Method::GET, "/device/turn/creds?username=dev-1"),
            (Method::POST, "/sso/logout"),
        ]
    );
    assert!(calls.iter().all(|(_, _, cookie)| cookie
        .as_deref()
        .is_some_and(|cookie| cookie.contains(TOKEN))));
}

#[tokio::test]
async fn facade_rejects_empty_device_id() {
    let (config, _cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let api = CloudApi::new(config).expect("api");

    let err = api.delete_device("").await.expect_err("empty id");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn facade_shares_one_session_and_ends_it_on_logout() {
    let (config, cloud) = spawn_cloud(RELAY_URIS.to_vec()).await;
    let fetcher = Arc::new(HttpCredentialFetcher::new(&config).expect("client"));
    let connector = Arc::new(WebSocketConnector::new(
        config.signaling_url.clone(),
        config.signaling_timeout,
    ));
    let engine = Arc::new(WebRtcEngine::new().expect("engine"));
    let api = CloudApi::with_parts(config, Arc::clone(&fetcher), connector, engine);

    api.self_info().await.expect("self");
    api.devices().await.expect("devices");
    let session = api.negotiator().session().await.expect("shared session");
    assert_eq!(session.token, TOKEN);
    assert_eq!(*cloud.logins.lock(), 1);
    assert_eq!(fetcher.live_sessions(), 1);

    api.logout().await.expect("logout");
    assert_eq!(fetcher.live_sessions(), 0);
    let logouts = cloud
        .calls
        .lock()
        .iter()
        .filter(|(method, path, _)| *method == Method::POST && path == "/sso/logout")
        .count();
    assert_eq!(logouts, 1);
}
