use std::env;
use std::time::Duration;

pub const DEFAULT_AUTH_URL: &str = "https://sso.ubnt.com/api/sso/v1";
pub const DEFAULT_DEVICE_URL: &str = "https://device-airos.svc.ubnt.com/api/airos/v1/unifi";
pub const DEFAULT_SIGNALING_URL: &str = "wss://device-airos.svc.ubnt.com/api/airos/v1/unifi/events";

/// Cloud client configuration
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Account identity used for the SSO login
    pub username: String,
    /// Account secret used for the SSO login
    pub password: String,
    /// SSO service base, hosts `/login`, `/logout` and `/user/self`
    pub auth_base_url: String,
    /// Device service base, hosts `/devices` and `/turn/creds`
    pub device_base_url: String,
    /// Websocket endpoint of the signaling service
    pub signaling_url: String,
    pub gzip: bool,
    pub http_timeout: Duration,
    /// Bound on every signaling action round trip
    pub signaling_timeout: Duration,
    /// Bound on each peer-connection engine call
    pub engine_timeout: Duration,
    /// How long local candidate gathering may run before the answer is sent anyway
    pub gather_timeout: Duration,
    /// Log signaling frames at debug instead of trace
    pub log_wire_frames: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            username: "unifi".to_string(),
            password: "unifi".to_string(),
            auth_base_url: DEFAULT_AUTH_URL.to_string(),
            device_base_url: DEFAULT_DEVICE_URL.to_string(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            gzip: true,
            http_timeout: Duration::from_secs(30),
            signaling_timeout: Duration::from_secs(30),
            engine_timeout: Duration::from_secs(15),
            gather_timeout: Duration::from_secs(10),
            log_wire_frames: false,
        }
    }
}

impl CloudConfig {
    /// Load configuration from `UNIFI_CLOUD_*` environment variables, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            username: env_string("UNIFI_CLOUD_USERNAME").unwrap_or(defaults.username),
            password: env_string("UNIFI_CLOUD_PASSWORD").unwrap_or(defaults.password),
            auth_base_url: env_string("UNIFI_CLOUD_AUTH_URL").unwrap_or(defaults.auth_base_url),
            device_base_url: env_string("UNIFI_CLOUD_DEVICE_URL")
                .unwrap_or(defaults.device_base_url),
            signaling_url: env_string("UNIFI_CLOUD_SIGNALING_URL")
                .unwrap_or(defaults.signaling_url),
            gzip: env_flag("UNIFI_CLOUD_GZIP").unwrap_or(defaults.gzip),
            http_timeout: env_secs("UNIFI_CLOUD_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout),
            signaling_timeout: env_secs("UNIFI_CLOUD_SIGNALING_TIMEOUT_SECS")
                .unwrap_or(defaults.signaling_timeout),
            engine_timeout: env_secs("UNIFI_CLOUD_ENGINE_TIMEOUT_SECS")
                .unwrap_or(defaults.engine_timeout),
            gather_timeout: env_secs("UNIFI_CLOUD_GATHER_TIMEOUT_SECS")
                .unwrap_or(defaults.gather_timeout),
            log_wire_frames: env_flag("UNIFI_CLOUD_LOG_WIRE").unwrap_or(defaults.log_wire_frames),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn env_flag(var: &str) -> Option<bool> {
    env_string(var).map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
}

fn env_secs(var: &str) -> Option<Duration> {
    env_string(var)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
