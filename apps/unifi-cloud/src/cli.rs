use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use unifi_cloud_rtc::CloudConfig;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "unifi-cloud",
    about = "Query UniFi cloud devices and answer their WebRTC offers",
    author,
    version
)]
pub struct Cli {
    #[arg(long, global = true, env = "UNIFI_CLOUD_USERNAME", help = "SSO account name")]
    pub username: Option<String>,

    #[arg(
        long,
        global = true,
        env = "UNIFI_CLOUD_PASSWORD",
        hide_env_values = true,
        help = "SSO account password"
    )]
    pub password: Option<String>,

    #[arg(
        long,
        global = true,
        env = "UNIFI_CLOUD_SIGNALING_URL",
        value_name = "URL",
        help = "Websocket endpoint of the signaling service"
    )]
    pub signaling_url: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Bound on each signaling round trip"
    )]
    pub signaling_timeout: Option<u64>,

    #[arg(long, global = true, help = "Log signaling frames at debug level")]
    pub log_wire: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "UNIFI_CLOUD_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "UNIFI_CLOUD_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the logged-in account
    #[command(name = "self")]
    SelfInfo,
    /// List devices bound to the account
    Devices,
    /// Remove a device from the account
    DeleteDevice { device_id: String },
    /// Print the raw TURN/STUN credentials issued for a device
    TurnCreds { device_id: String },
    /// Negotiate a peer connection with each device, concurrently
    Connect {
        #[arg(required = true)]
        device_ids: Vec<String>,
    },
}

impl Cli {
    /// Command-line values win over the environment-derived configuration.
    pub fn apply(&self, mut config: CloudConfig) -> CloudConfig {
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.clone();
        }
        if let Some(url) = &self.signaling_url {
            config.signaling_url = url.clone();
        }
        if let Some(secs) = self.signaling_timeout {
            config.signaling_timeout = Duration::from_secs(secs);
        }
        if self.log_wire {
            config.log_wire_frames = true;
        }
        config
    }
}
