//! Peer-connection capabilities used by the negotiation, plus a
//! `webrtc`-crate engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{CloudError, CloudResult};
use crate::sdp::SdpDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: SdpDocument,
}

impl SessionDescription {
    pub fn offer(sdp: SdpDocument) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp,
        }
    }
}

#[async_trait]
pub trait PeerConnectionEngine: Send + Sync {
    async fn create(&self, ice_servers: &[IceServer]) -> CloudResult<Box<dyn PeerSession>>;
}

/// One engine-side connection. Callers go through [`PeerConnectionHandle`].
#[async_trait]
pub trait PeerSession: Send {
    async fn set_remote_description(&mut self, description: SessionDescription) -> CloudResult<()>;

    async fn create_answer(&mut self) -> CloudResult<SdpDocument>;

    async fn set_local_description(&mut self, sdp: &SdpDocument) -> CloudResult<()>;

    /// Waits for gathering to finish or for `gather_timeout`, then returns the
    /// local description with whatever candidates were gathered.
    async fn collect_ice_candidates(&mut self, gather_timeout: Duration) -> CloudResult<SdpDocument>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Active,
    Failed,
    Closed,
}

/// Bounds every engine call and latches the first failure.
pub struct PeerConnectionHandle {
    session: Box<dyn PeerSession>,
    state: HandleState,
    op_timeout: Duration,
}

impl PeerConnectionHandle {
    pub async fn create(
        engine: &dyn PeerConnectionEngine,
        ice_servers: &[IceServer],
        op_timeout: Duration,
    ) -> CloudResult<Self> {
        let session = bounded(op_timeout, "create", engine.create(ice_servers)).await?;
        Ok(Self {
            session,
            state: HandleState::Active,
            op_timeout,
        })
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    fn ensure_active(&self, op: &str) -> CloudResult<()> {
        match self.state {
            HandleState::Active => Ok(()),
            HandleState::Failed => Err(CloudError::NegotiationEngine(format!(
                "{op} on a failed peer connection"
            ))),
            HandleState::Closed => Err(CloudError::NegotiationEngine(format!(
                "{op} on a closed peer connection"
            ))),
        }
    }

    fn settle<T>(&mut self, result: CloudResult<T>) -> CloudResult<T> {
        if result.is_err() {
            self.state = HandleState::Failed;
        }
        result
    }

    pub async fn set_remote_description(&mut self, description: SessionDescription) -> CloudResult<()> {
        self.ensure_active("set_remote_description")?;
        let result = bounded(
            self.op_timeout,
            "set_remote_description",
            self.session.set_remote_description(description),
        )
        .await;
        self.settle(result)
    }

    pub async fn create_answer(&mut self) -> CloudResult<SdpDocument> {
        self.ensure_active("create_answer")?;
        let result = bounded(self.op_timeout, "create_answer", self.session.create_answer()).await;
        self.settle(result)
    }

    pub async fn set_local_description(&mut self, sdp: &SdpDocument) -> CloudResult<()> {
        self.ensure_active("set_local_description")?;
        let result = bounded(
            self.op_timeout,
            "set_local_description",
            self.session.set_local_description(sdp),
        )
        .await;
        self.settle(result)
    }

    pub async fn collect_ice_candidates(&mut self, gather_timeout: Duration) -> CloudResult<SdpDocument> {
        self.ensure_active("collect_ice_candidates")?;
        let result = bounded(
            gather_timeout + self.op_timeout,
            "collect_ice_candidates",
            self.session.collect_ice_candidates(gather_timeout),
        )
        .await;
        self.settle(result)
    }

    pub async fn close(&mut self) {
        if self.state == HandleState::Closed {
            return;
        }
        self.session.close().await;
        self.state = HandleState::Closed;
    }
}

async fn bounded<T>(
    limit: Duration,
    op: &str,
    fut: impl Future<Output = CloudResult<T>>,
) -> CloudResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CloudError::NegotiationEngine(format!(
            "{op} timed out after {limit:?}"
        ))),
    }
}

/// [`PeerConnectionEngine`] on top of the `webrtc` crate with the default
/// codecs and interceptors registered, so media offers can be answered.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> CloudResult<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(CloudError::engine)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(CloudError::engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionEngine for WebRtcEngine {
    async fn create(&self, ice_servers: &[IceServer]) -> CloudResult<Box<dyn PeerSession>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: vec![server.url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(CloudError::engine)?,
        );
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                tracing::info!(target: "unifi_cloud::peer", state = ?state, "peer connection state changed");
            })
        }));
        tracing::debug!(
            target: "unifi_cloud::peer",
            servers = ice_servers.len(),
            "peer connection created"
        );
        Ok(Box::new(WebRtcPeer {
            pc,
            gather: None,
            closed: false,
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gather: Option<mpsc::Receiver<()>>,
    closed: bool,
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn set_remote_description(&mut self, description: SessionDescription) -> CloudResult<()> {
        let text = description.sdp.to_string();
        let description = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(text),
            SdpType::Answer => RTCSessionDescription::answer(text),
        }
        .map_err(|err| CloudError::SdpApply(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| CloudError::SdpApply(err.to_string()))
    }

    async fn create_answer(&mut self) -> CloudResult<SdpDocument> {
        if self.pc.remote_description().await.is_none() {
            return Err(CloudError::NegotiationEngine(
                "create_answer without a remote description".into(),
            ));
        }
        let answer = self.pc.create_answer(None).await.map_err(CloudError::engine)?;
        Ok(SdpDocument::parse(&answer.sdp))
    }

    async fn set_local_description(&mut self, sdp: &SdpDocument) -> CloudResult<()> {
        let description =
            RTCSessionDescription::answer(sdp.to_string()).map_err(CloudError::engine)?;
        // Arm before applying so a fast gather cannot complete unobserved.
        self.gather = Some(self.pc.gathering_complete_promise().await);
        self.pc
            .set_local_description(description)
            .await
            .map_err(CloudError::engine)
    }

    async fn collect_ice_candidates(&mut self, gather_timeout: Duration) -> CloudResult<SdpDocument> {
        if let Some(mut gather) = self.gather.take() {
            if tokio::time::timeout(gather_timeout, gather.recv()).await.is_err() {
                tracing::warn!(
                    target: "unifi_cloud::peer",
                    timeout_ms = gather_timeout.as_millis() as u64,
                    "candidate gathering incomplete; using candidates gathered so far"
                );
            }
        }
        let local = self.pc.local_description().await.ok_or_else(|| {
            CloudError::NegotiationEngine("no local description after gathering".into())
        })?;
        Ok(SdpDocument::parse(&local.sdp))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "unifi_cloud::peer", error = %err, "peer connection close failed");
        }
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let pc = Arc::clone(&self.pc);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}
