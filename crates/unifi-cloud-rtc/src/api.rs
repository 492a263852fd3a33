//! Cloud API facade: thin pass-throughs to the SSO and device services, and
//! the negotiation itself. REST calls and negotiations share the
//! negotiator's session.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tracing::{Instrument, Span};

use crate::config::CloudConfig;
use crate::credentials::{HttpCredentialFetcher, ServiceBase, Session};
use crate::error::{CloudError, CloudResult};
use crate::negotiation::{NegotiationFailure, NegotiationOutcome, Negotiator, NegotiatorConfig};
use crate::peer::{PeerConnectionEngine, WebRtcEngine};
use crate::signaling::{SignalingConnector, WebSocketConnector};

pub struct CloudApi {
    config: CloudConfig,
    fetcher: Arc<HttpCredentialFetcher>,
    negotiator: Negotiator,
    span: Span,
}

impl CloudApi {
    /// Facade wired to the real services: `reqwest` for REST, a websocket
    /// for signaling and the `webrtc` engine.
    pub fn new(config: CloudConfig) -> CloudResult<Self> {
        let fetcher = Arc::new(HttpCredentialFetcher::new(&config)?);
        let connector = Arc::new(
            WebSocketConnector::new(config.signaling_url.clone(), config.signaling_timeout)
                .log_wire_frames(config.log_wire_frames),
        );
        let engine = Arc::new(WebRtcEngine::new()?);
        Ok(Self::with_parts(config, fetcher, connector, engine))
    }

    pub fn with_parts(
        config: CloudConfig,
        fetcher: Arc<HttpCredentialFetcher>,
        connector: Arc<dyn SignalingConnector>,
        engine: Arc<dyn PeerConnectionEngine>,
    ) -> Self {
        let negotiator = Negotiator::new(
            NegotiatorConfig::from(&config),
            fetcher.clone(),
            connector,
            engine,
        );
        Self {
            config,
            fetcher,
            negotiator,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.negotiator = self.negotiator.with_span(span.clone());
        self.span = span;
        self
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub async fn login(&self) -> CloudResult<Session> {
        self.negotiator.login().await
    }

    /// Closes the signaling channel, then ends the session if there is one.
    pub async fn logout(&self) -> CloudResult<()> {
        self.negotiator.logout().await
    }

    async fn call(
        &self,
        base: ServiceBase,
        path: &str,
        query: &[(&str, &str)],
        method: Method,
    ) -> CloudResult<Value> {
        let session = self.negotiator.session().await?;
        self.fetcher
            .request(&session, base, path, query, None, method)
            .instrument(self.span.clone())
            .await
    }

    pub async fn self_info(&self) -> CloudResult<Value> {
        self.call(ServiceBase::Auth, "/user/self", &[], Method::GET).await
    }

    pub async fn devices(&self) -> CloudResult<Value> {
        self.call(ServiceBase::Device, "/devices", &[], Method::GET).await
    }

    pub async fn delete_device(&self, device_id: &str) -> CloudResult<Value> {
        if device_id.is_empty() {
            return Err(CloudError::Config("device id must not be empty".into()));
        }
        let path = format!("/devices/{device_id}");
        self.call(ServiceBase::Device, &path, &[], Method::DELETE).await
    }

    /// Raw `/turn/creds` response for a device.
    pub async fn turn_creds(&self, device_id: &str) -> CloudResult<Value> {
        self.call(
            ServiceBase::Device,
            "/turn/creds",
            &[("username", device_id)],
            Method::GET,
        )
        .await
    }

    pub async fn open_webrtc_as_called(
        &self,
        device_id: &str,
    ) -> Result<NegotiationOutcome, NegotiationFailure> {
        self.negotiator.negotiate(device_id).await
    }

    /// Idempotent; cancels any negotiation still waiting on the channel.
    pub async fn close_webrtc(&self) {
        self.negotiator.close().await;
    }
}
