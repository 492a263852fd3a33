//! The negotiation sequence that turns a device id into an answered peer
//! connection.
//!
//! Each step consumes a [`NegotiationContext`] and hands back the advanced
//! one; the driver stops at the first error and reports the step it was
//! entering.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{Instrument, Span};

use crate::config::CloudConfig;
use crate::credentials::{CredentialFetcher, DeviceCredentials, Session, TURN_CREDENTIAL_TTL};
use crate::error::{CloudError, CloudResult, ErrorKind};
use crate::peer::{IceServer, PeerConnectionEngine, PeerConnectionHandle, SessionDescription};
use crate::sdp::{self, IceCandidate, SdpDocument};
use crate::signaling::{ActionChannel, SDP_EXCHANGE, SignalingConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Authenticated,
    SignalingConnected,
    CredentialsReady,
    PeerConnectionCreated,
    RemoteOfferReceived,
    RemoteDescriptionSet,
    LocalAnswerCreated,
    LocalDescriptionSet,
    CandidatesCollected,
    CandidateSelected,
    AnswerSent,
    Completed,
    Failed,
}

impl NegotiationState {
    /// Successor on the happy path; `None` for the terminal states.
    pub fn next(self) -> Option<Self> {
        use NegotiationState::*;
        Some(match self {
            Idle => Authenticated,
            Authenticated => SignalingConnected,
            SignalingConnected => CredentialsReady,
            CredentialsReady => PeerConnectionCreated,
            PeerConnectionCreated => RemoteOfferReceived,
            RemoteOfferReceived => RemoteDescriptionSet,
            RemoteDescriptionSet => LocalAnswerCreated,
            LocalAnswerCreated => LocalDescriptionSet,
            LocalDescriptionSet => CandidatesCollected,
            CandidatesCollected => CandidateSelected,
            CandidateSelected => AnswerSent,
            AnswerSent => Completed,
            Completed | Failed => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Completed | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Working state of one negotiation.
pub struct NegotiationContext {
    state: NegotiationState,
    device_id: String,
    session: Option<Session>,
    channel: Option<Arc<dyn ActionChannel>>,
    credentials: Option<DeviceCredentials>,
    peer: Option<PeerConnectionHandle>,
    web_rtc_id: Option<String>,
    remote_sdp: Option<SdpDocument>,
    local_sdp: Option<SdpDocument>,
    selected: Option<IceCandidate>,
    acknowledgement: Option<Value>,
}

impl NegotiationContext {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            state: NegotiationState::Idle,
            device_id: device_id.into(),
            session: None,
            channel: None,
            credentials: None,
            peer: None,
            web_rtc_id: None,
            remote_sdp: None,
            local_sdp: None,
            selected: None,
            acknowledgement: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn advance(mut self, to: NegotiationState) -> Self {
        debug_assert_eq!(self.state.next(), Some(to), "out-of-order transition");
        self.state = to;
        self
    }

    fn session(&self) -> CloudResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| CloudError::Auth("no session in negotiation".into()))
    }

    fn channel(&self) -> CloudResult<Arc<dyn ActionChannel>> {
        self.channel
            .clone()
            .ok_or_else(|| CloudError::Cancelled("no signaling channel in negotiation".into()))
    }

    fn credentials(&self) -> CloudResult<&DeviceCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| CloudError::Credential("no device credentials in negotiation".into()))
    }

    fn peer_mut(&mut self) -> CloudResult<&mut PeerConnectionHandle> {
        self.peer
            .as_mut()
            .ok_or_else(|| CloudError::NegotiationEngine("no peer connection in negotiation".into()))
    }

    fn missing(what: &str) -> CloudError {
        CloudError::NegotiationEngine(format!("{what} missing from negotiation"))
    }
}

#[derive(Debug, Deserialize)]
struct OfferResponse {
    #[serde(rename = "webRtcId")]
    web_rtc_id: String,
    sdp: String,
}

/// Result of a completed negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    pub device_id: String,
    pub web_rtc_id: String,
    /// Remote offer as applied, TCP candidates removed.
    pub offer_sdp: String,
    /// Answer as sent, connection line rewritten.
    pub answer_sdp: String,
    pub selected: IceCandidate,
    pub acknowledgement: Value,
}

#[derive(Debug, Error)]
#[error("negotiation for device {device_id} failed entering {step}: {error}")]
pub struct NegotiationFailure {
    pub device_id: String,
    /// State the negotiation was trying to enter.
    pub step: NegotiationState,
    #[source]
    pub error: CloudError,
}

impl NegotiationFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn into_error(self) -> CloudError {
        self.error
    }
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub identity: String,
    pub secret: String,
    pub engine_timeout: Duration,
    pub gather_timeout: Duration,
}

impl From<&CloudConfig> for NegotiatorConfig {
    fn from(config: &CloudConfig) -> Self {
        Self {
            identity: config.username.clone(),
            secret: config.password.clone(),
            engine_timeout: config.engine_timeout,
            gather_timeout: config.gather_timeout,
        }
    }
}

/// Runs negotiations. Shareable across tasks; concurrent negotiations for
/// different devices share one session and one signaling channel.
pub struct Negotiator {
    config: NegotiatorConfig,
    credentials: Arc<dyn CredentialFetcher>,
    connector: Arc<dyn SignalingConnector>,
    engine: Arc<dyn PeerConnectionEngine>,
    session: AsyncMutex<Option<Session>>,
    channel: AsyncMutex<Option<Arc<dyn ActionChannel>>>,
    span: Span,
}

impl Negotiator {
    pub fn new(
        config: NegotiatorConfig,
        credentials: Arc<dyn CredentialFetcher>,
        connector: Arc<dyn SignalingConnector>,
        engine: Arc<dyn PeerConnectionEngine>,
    ) -> Self {
        Self {
            config,
            credentials,
            connector,
            engine,
            session: AsyncMutex::new(None),
            channel: AsyncMutex::new(None),
            span: Span::none(),
        }
    }

    /// Parent span for every negotiation this negotiator runs.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn negotiate(&self, device_id: &str) -> Result<NegotiationOutcome, NegotiationFailure> {
        let (progress, _) = watch::channel(NegotiationState::Idle);
        self.negotiate_with_progress(device_id, &progress).await
    }

    /// Like [`Negotiator::negotiate`], publishing every state entered.
    pub async fn negotiate_with_progress(
        &self,
        device_id: &str,
        progress: &watch::Sender<NegotiationState>,
    ) -> Result<NegotiationOutcome, NegotiationFailure> {
        let span = tracing::info_span!(
            target: "unifi_cloud::negotiation",
            parent: &self.span,
            "negotiation",
            device_id = %device_id
        );
        self.drive(NegotiationContext::new(device_id), progress)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        mut ctx: NegotiationContext,
        progress: &watch::Sender<NegotiationState>,
    ) -> Result<NegotiationOutcome, NegotiationFailure> {
        progress.send_replace(ctx.state());
        while let Some(step) = ctx.state().next() {
            let device_id = ctx.device_id().to_string();
            let result = if step == NegotiationState::Completed {
                self.complete(ctx).await.map(Ok)
            } else {
                self.step(ctx).await.map(Err)
            };
            match result {
                Ok(Ok(outcome)) => {
                    progress.send_replace(NegotiationState::Completed);
                    tracing::info!(
                        target: "unifi_cloud::negotiation",
                        web_rtc_id = %outcome.web_rtc_id,
                        address = %outcome.selected.address,
                        "negotiation completed"
                    );
                    return Ok(outcome);
                }
                Ok(Err(next)) => {
                    tracing::debug!(target: "unifi_cloud::negotiation", state = %next.state(), "advanced");
                    progress.send_replace(next.state());
                    ctx = next;
                }
                Err(error) => {
                    tracing::warn!(
                        target: "unifi_cloud::negotiation",
                        step = %step,
                        kind = ?error.kind(),
                        error = %error,
                        "negotiation failed"
                    );
                    progress.send_replace(NegotiationState::Failed);
                    return Err(NegotiationFailure {
                        device_id,
                        step,
                        error,
                    });
                }
            }
        }
        Err(NegotiationFailure {
            device_id: ctx.device_id,
            step: NegotiationState::Completed,
            error: CloudError::Cancelled("negotiation already terminal".into()),
        })
    }

    async fn step(&self, ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        use NegotiationState::*;
        match ctx.state() {
            Idle => self.authenticate(ctx).await,
            Authenticated => self.connect_signaling(ctx).await,
            SignalingConnected => self.fetch_credentials(ctx).await,
            CredentialsReady => self.create_peer(ctx).await,
            PeerConnectionCreated => self.request_offer(ctx).await,
            RemoteOfferReceived => self.apply_remote_offer(ctx).await,
            RemoteDescriptionSet => self.create_answer(ctx).await,
            LocalAnswerCreated => self.apply_local_answer(ctx).await,
            LocalDescriptionSet => self.collect_candidates(ctx).await,
            CandidatesCollected => self.select_candidate(ctx),
            CandidateSelected => self.send_answer(ctx).await,
            AnswerSent | Completed | Failed => Ok(ctx),
        }
    }

    async fn authenticate(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let session = self.session().await?;
        ctx.session = Some(session);
        Ok(ctx.advance(NegotiationState::Authenticated))
    }

    async fn connect_signaling(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let session = ctx.session()?.clone();
        let channel = self.shared_channel(&session).await?;
        ctx.channel = Some(channel);
        Ok(ctx.advance(NegotiationState::SignalingConnected))
    }

    async fn shared_channel(&self, session: &Session) -> CloudResult<Arc<dyn ActionChannel>> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref().filter(|channel| channel.is_open()) {
            return Ok(Arc::clone(channel));
        }
        let channel = self.connector.connect(session).await?;
        tracing::debug!(target: "unifi_cloud::negotiation", "signaling channel opened");
        *guard = Some(Arc::clone(&channel));
        Ok(channel)
    }

    async fn fetch_credentials(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let session = ctx.session()?.clone();
        let device_id = ctx.device_id().to_string();
        let credentials = self
            .credentials
            .fetch_turn_credentials(&session, &device_id)
            .await?;
        ctx.credentials = Some(credentials);
        Ok(ctx.advance(NegotiationState::CredentialsReady))
    }

    async fn create_peer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let credentials = ctx.credentials()?;
        let servers = [
            IceServer {
                url: credentials.stun_uri.clone(),
            },
            IceServer {
                url: credentials.turn_uri.clone(),
            },
        ];
        let peer =
            PeerConnectionHandle::create(self.engine.as_ref(), &servers, self.config.engine_timeout)
                .await?;
        ctx.peer = Some(peer);
        Ok(ctx.advance(NegotiationState::PeerConnectionCreated))
    }

    async fn request_offer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let credentials = ctx.credentials()?;
        let payload = json!({
            "username": credentials.username,
            "password": credentials.password,
            "ttl": TURN_CREDENTIAL_TTL,
            "type": "OFFER",
            "stunUri": credentials.stun_uri,
            "turnUri": credentials.turn_uri,
        });
        let channel = ctx.channel()?;
        let device_id = ctx.device_id().to_string();
        let response = channel
            .action_request(SDP_EXCHANGE, &device_id, payload)
            .await?;
        let offer: OfferResponse = serde_json::from_value(response)
            .map_err(|err| CloudError::Signaling(format!("malformed offer response: {err}")))?;
        tracing::debug!(
            target: "unifi_cloud::negotiation",
            web_rtc_id = %offer.web_rtc_id,
            "remote offer received"
        );
        ctx.web_rtc_id = Some(offer.web_rtc_id);
        ctx.remote_sdp = Some(SdpDocument::parse(&offer.sdp));
        Ok(ctx.advance(NegotiationState::RemoteOfferReceived))
    }

    async fn apply_remote_offer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let remote = ctx
            .remote_sdp
            .take()
            .ok_or_else(|| NegotiationContext::missing("remote offer"))?;
        let filtered = sdp::strip_tcp_candidates(&remote);
        ctx.peer_mut()?
            .set_remote_description(SessionDescription::offer(filtered.clone()))
            .await?;
        ctx.remote_sdp = Some(filtered);
        Ok(ctx.advance(NegotiationState::RemoteDescriptionSet))
    }

    async fn create_answer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let answer = ctx.peer_mut()?.create_answer().await?;
        ctx.local_sdp = Some(answer);
        Ok(ctx.advance(NegotiationState::LocalAnswerCreated))
    }

    async fn apply_local_answer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let answer = ctx
            .local_sdp
            .take()
            .ok_or_else(|| NegotiationContext::missing("local answer"))?;
        ctx.peer_mut()?.set_local_description(&answer).await?;
        ctx.local_sdp = Some(answer);
        Ok(ctx.advance(NegotiationState::LocalDescriptionSet))
    }

    async fn collect_candidates(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let gathered = ctx
            .peer_mut()?
            .collect_ice_candidates(self.config.gather_timeout)
            .await?;
        ctx.local_sdp = Some(gathered);
        Ok(ctx.advance(NegotiationState::CandidatesCollected))
    }

    fn select_candidate(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let local = ctx
            .local_sdp
            .take()
            .ok_or_else(|| NegotiationContext::missing("local description"))?;
        let best = sdp::select_best_udp_candidate(&local)?;
        let rewritten = sdp::rewrite_connection_address(&local, &best)?;
        tracing::debug!(
            target: "unifi_cloud::negotiation",
            address = %best.address,
            port = best.port,
            priority = best.priority,
            "candidate selected"
        );
        ctx.local_sdp = Some(rewritten);
        ctx.selected = Some(best);
        Ok(ctx.advance(NegotiationState::CandidateSelected))
    }

    async fn send_answer(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationContext> {
        let answer = ctx
            .local_sdp
            .as_ref()
            .ok_or_else(|| NegotiationContext::missing("rewritten answer"))?;
        let web_rtc_id = ctx
            .web_rtc_id
            .as_deref()
            .ok_or_else(|| NegotiationContext::missing("webRtcId"))?;
        let payload = json!({
            "sdpAnswer": answer.to_string(),
            "type": "ANSWER",
            "webRtcId": web_rtc_id,
        });
        let channel = ctx.channel()?;
        let device_id = ctx.device_id().to_string();
        let acknowledgement = channel
            .action_request(SDP_EXCHANGE, &device_id, payload)
            .await?;
        ctx.acknowledgement = Some(acknowledgement);
        Ok(ctx.advance(NegotiationState::AnswerSent))
    }

    /// Enters `Completed`: closes the peer connection and hands the rest of
    /// the context over as the outcome.
    async fn complete(&self, mut ctx: NegotiationContext) -> CloudResult<NegotiationOutcome> {
        if let Some(peer) = ctx.peer.as_mut() {
            peer.close().await;
        }
        let ctx = ctx.advance(NegotiationState::Completed);
        Ok(NegotiationOutcome {
            web_rtc_id: ctx
                .web_rtc_id
                .ok_or_else(|| NegotiationContext::missing("webRtcId"))?,
            offer_sdp: ctx
                .remote_sdp
                .ok_or_else(|| NegotiationContext::missing("remote offer"))?
                .to_string(),
            answer_sdp: ctx
                .local_sdp
                .ok_or_else(|| NegotiationContext::missing("rewritten answer"))?
                .to_string(),
            selected: ctx
                .selected
                .ok_or_else(|| NegotiationContext::missing("selected candidate"))?,
            acknowledgement: ctx.acknowledgement.unwrap_or(Value::Null),
            device_id: ctx.device_id,
        })
    }

    /// The shared session, logging in on first use. Concurrent callers wait
    /// for a single login.
    pub async fn session(&self) -> CloudResult<Session> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self
            .credentials
            .authenticate(&self.config.identity, &self.config.secret)
            .await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Logs in afresh, ending the session this replaces.
    pub async fn login(&self) -> CloudResult<Session> {
        let session = self
            .credentials
            .authenticate(&self.config.identity, &self.config.secret)
            .await?;
        let previous = self.session.lock().await.replace(session.clone());
        if let Some(previous) = previous {
            if let Err(err) = self.credentials.logout(&previous).await {
                tracing::warn!(target: "unifi_cloud::negotiation", error = %err, "replaced session did not log out");
            }
        }
        Ok(session)
    }

    /// Closes the shared signaling channel, cancelling in-flight requests.
    /// Safe when no channel was ever opened.
    pub async fn close(&self) {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.disconnect().await;
        }
    }

    /// Closes the channel, then ends the shared session if one was opened.
    pub async fn logout(&self) -> CloudResult<()> {
        self.close().await;
        let session = self.session.lock().await.take();
        match session {
            Some(session) => self.credentials.logout(&session).await,
            None => Ok(()),
        }
    }
}
