//! Client for the UniFi cloud: SSO session, device REST calls and the
//! signaling exchange that answers a device's WebRTC offer.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod negotiation;
pub mod peer;
pub mod sdp;
pub mod signaling;

pub use api::CloudApi;
pub use config::CloudConfig;
pub use credentials::{
    CredentialFetcher, DeviceCredentials, HttpCredentialFetcher, Session, SessionCredential,
};
pub use error::{CloudError, CloudResult, ErrorKind};
pub use negotiation::{
    NegotiationFailure, NegotiationOutcome, NegotiationState, Negotiator, NegotiatorConfig,
};
pub use peer::{IceServer, PeerConnectionEngine, PeerSession, SessionDescription, WebRtcEngine};
pub use sdp::{IceCandidate, SdpDocument};
pub use signaling::{ActionChannel, SignalingChannel, SignalingConnector, WebSocketConnector};
