use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("credential lookup failed: {0}")]
    Credential(String),
    #[error("signaling connect failed: {0}")]
    SignalingConnect(String),
    #[error("signaling action {action} for device {device_id} timed out after {after:?}")]
    SignalingTimeout {
        action: String,
        device_id: String,
        after: Duration,
    },
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("remote description rejected: {0}")]
    SdpApply(String),
    #[error("negotiation engine error: {0}")]
    NegotiationEngine(String),
    #[error("no udp candidate in local description")]
    NoCandidate,
    #[error("malformed sdp: {0}")]
    MalformedSdp(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Payload-free discriminant of [`CloudError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Credential,
    SignalingConnect,
    SignalingTimeout,
    Signaling,
    SdpApply,
    NegotiationEngine,
    NoCandidate,
    MalformedSdp,
    Cancelled,
    Http,
    UnexpectedStatus,
    Config,
}

impl CloudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloudError::Auth(_) => ErrorKind::Auth,
            CloudError::Credential(_) => ErrorKind::Credential,
            CloudError::SignalingConnect(_) => ErrorKind::SignalingConnect,
            CloudError::SignalingTimeout { .. } => ErrorKind::SignalingTimeout,
            CloudError::Signaling(_) => ErrorKind::Signaling,
            CloudError::SdpApply(_) => ErrorKind::SdpApply,
            CloudError::NegotiationEngine(_) => ErrorKind::NegotiationEngine,
            CloudError::NoCandidate => ErrorKind::NoCandidate,
            CloudError::MalformedSdp(_) => ErrorKind::MalformedSdp,
            CloudError::Cancelled(_) => ErrorKind::Cancelled,
            CloudError::Http(_) => ErrorKind::Http,
            CloudError::UnexpectedStatus { .. } => ErrorKind::UnexpectedStatus,
            CloudError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn engine(err: impl std::fmt::Display) -> Self {
        CloudError::NegotiationEngine(err.to_string())
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
