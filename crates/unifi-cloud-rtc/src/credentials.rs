//! Session login and device-scoped TURN/STUN credential lookup.

use std::collections::HashSet;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::CloudConfig;
use crate::error::{CloudError, CloudResult};

/// TTL the device is asked to honour for the relay credentials.
pub const TURN_CREDENTIAL_TTL: u64 = 86_400;
const AUTH_COOKIE: &str = "UBIC_AUTH";

#[derive(Clone, PartialEq, Eq)]
pub enum SessionCredential {
    Cookie(String),
    Bearer(String),
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCredential::Cookie(_) => f.write_str("Cookie(<redacted>)"),
            SessionCredential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

#[derive(Clone)]
pub struct Session {
    pub identity: String,
    pub token: String,
    pub credential: SessionCredential,
    pub issued_at: SystemTime,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("credential", &self.credential)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Raw `/turn/creds` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub username: String,
    pub password: String,
    pub ttl_seconds: u64,
    pub stun_uri: String,
    pub turn_uri: String,
}

impl DeviceCredentials {
    /// Picks the first `stun*` and the first `turn*` URI by scheme token.
    pub fn from_turn_response(raw: TurnCredentials) -> CloudResult<Self> {
        let stun_uri = first_with_scheme(&raw.uris, "stun").ok_or_else(|| {
            CloudError::Credential(format!("no stun uri in {:?}", raw.uris))
        })?;
        let turn_uri = first_with_scheme(&raw.uris, "turn").ok_or_else(|| {
            CloudError::Credential(format!("no turn uri in {:?}", raw.uris))
        })?;
        Ok(Self {
            username: raw.username,
            password: raw.password,
            ttl_seconds: raw.ttl.unwrap_or(TURN_CREDENTIAL_TTL),
            stun_uri,
            turn_uri,
        })
    }
}

fn first_with_scheme(uris: &[String], prefix: &str) -> Option<String> {
    uris.iter()
        .find(|uri| {
            uri.split(':')
                .next()
                .is_some_and(|scheme| scheme.to_ascii_lowercase().starts_with(prefix))
        })
        .cloned()
}

#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn authenticate(&self, identity: &str, secret: &str) -> CloudResult<Session>;

    async fn fetch_turn_credentials(
        &self,
        session: &Session,
        device_id: &str,
    ) -> CloudResult<DeviceCredentials>;

    /// Ends the session server-side; it is unusable afterwards even if the
    /// call fails.
    async fn logout(&self, session: &Session) -> CloudResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceBase {
    Auth,
    Device,
}

/// `reqwest`-backed fetcher for the SSO and device services.
pub struct HttpCredentialFetcher {
    http: Client,
    auth_base: String,
    device_base: String,
    /// Tokens issued by this fetcher and not yet logged out.
    live_tokens: RwLock<HashSet<String>>,
}

impl HttpCredentialFetcher {
    pub fn new(config: &CloudConfig) -> CloudResult<Self> {
        let http = Client::builder()
            .gzip(config.gzip)
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| CloudError::Config(format!("http client: {err}")))?;
        Ok(Self {
            http,
            auth_base: config.auth_base_url.trim_end_matches('/').to_string(),
            device_base: config.device_base_url.trim_end_matches('/').to_string(),
            live_tokens: RwLock::new(HashSet::new()),
        })
    }

    fn base(&self, base: ServiceBase) -> &str {
        match base {
            ServiceBase::Auth => &self.auth_base,
            ServiceBase::Device => &self.device_base,
        }
    }

    fn ensure_active(&self, session: &Session) -> CloudResult<()> {
        if self.live_tokens.read().contains(&session.token) {
            Ok(())
        } else {
            Err(CloudError::Auth("session is logged out".into()))
        }
    }

    fn authorize(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        match &session.credential {
            SessionCredential::Cookie(cookie) => builder.header(COOKIE, cookie),
            SessionCredential::Bearer(token) => builder.bearer_auth(token),
        }
    }

    /// Authenticated call against one of the two services. An empty body
    /// decodes as `null`.
    pub async fn request(
        &self,
        session: &Session,
        base: ServiceBase,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        method: Method,
    ) -> CloudResult<Value> {
        self.ensure_active(session)?;
        let url = format!("{}{}", self.base(base), path);
        debug!(target: "unifi_cloud::credentials", %method, url = %url, "cloud request");
        let mut builder = self.http.request(method, &url).query(query);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let res = self.authorize(builder, session).send().await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::Auth(format!("{url} rejected the session ({status})")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(CloudError::UnexpectedStatus { status, body });
        }
        let text = res.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| CloudError::UnexpectedStatus {
                status,
                body: format!("invalid json ({err}): {text}"),
            })
    }

    /// Sessions issued here and not yet logged out.
    pub fn live_sessions(&self) -> usize {
        self.live_tokens.read().len()
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn authenticate(&self, identity: &str, secret: &str) -> CloudResult<Session> {
        let url = format!("{}/login", self.auth_base);
        let res = self
            .http
            .post(&url)
            .json(&json!({ "user": identity, "password": secret }))
            .send()
            .await
            .map_err(|err| CloudError::Auth(format!("login request failed: {err}")))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!("login rejected ({status}): {body}")));
        }

        let cookies = cookie_pairs(
            res.headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );
        let body: Value = res.json().await.unwrap_or(Value::Null);

        let (token, credential) = if let Some(token) = session_token(&cookies) {
            let header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            (token, SessionCredential::Cookie(header))
        } else if let Some(token) = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
        {
            (token.to_string(), SessionCredential::Bearer(token.to_string()))
        } else {
            return Err(CloudError::Auth(
                "login response carried no session cookie or token".into(),
            ));
        };

        self.live_tokens.write().insert(token.clone());
        info!(target: "unifi_cloud::credentials", identity, "authenticated");
        Ok(Session {
            identity: identity.to_string(),
            token,
            credential,
            issued_at: SystemTime::now(),
        })
    }

    async fn fetch_turn_credentials(
        &self,
        session: &Session,
        device_id: &str,
    ) -> CloudResult<DeviceCredentials> {
        let value = self
            .request(
                session,
                ServiceBase::Device,
                "/turn/creds",
                &[("username", device_id)],
                None,
                Method::GET,
            )
            .await
            .map_err(|err| match err {
                CloudError::Credential(message) => CloudError::Credential(message),
                other => CloudError::Credential(format!("device {device_id}: {other}")),
            })?;
        let raw: TurnCredentials = serde_json::from_value(value).map_err(|err| {
            CloudError::Credential(format!("device {device_id}: malformed turn credentials: {err}"))
        })?;
        let creds = DeviceCredentials::from_turn_response(raw)?;
        debug!(
            target: "unifi_cloud::credentials",
            device_id,
            stun = %creds.stun_uri,
            turn = %creds.turn_uri,
            "turn credentials ready"
        );
        Ok(creds)
    }

    async fn logout(&self, session: &Session) -> CloudResult<()> {
        let result = self
            .request(session, ServiceBase::Auth, "/logout", &[], None, Method::POST)
            .await;
        self.live_tokens.write().remove(&session.token);
        info!(target: "unifi_cloud::credentials", identity = %session.identity, "logged out");
        result.map(|_| ())
    }
}

/// `name=value` pairs from `Set-Cookie` header values, attributes dropped.
fn cookie_pairs<'a>(headers: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    headers
        .filter_map(|header| {
            let pair = header.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            if name.is_empty() {
                warn!(target: "unifi_cloud::credentials", "ignoring nameless cookie");
                return None;
            }
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn session_token(cookies: &[(String, String)]) -> Option<String> {
    cookies
        .iter()
        .find(|(name, _)| name == AUTH_COOKIE)
        .or_else(|| cookies.first())
        .map(|(_, value)| value.clone())
}
