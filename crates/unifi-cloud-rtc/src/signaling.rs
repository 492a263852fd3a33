//! Correlated action requests over the cloud signaling websocket.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use uuid::Uuid;

use crate::credentials::{Session, SessionCredential};
use crate::error::{CloudError, CloudResult};

pub const SDP_EXCHANGE: &str = "sdp_exchange";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEnvelope {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub payload: Value,
}

/// Frame sent to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFrame {
    pub id: String,
    pub action: String,
    pub payload: ActionEnvelope,
}

/// Frame received from the cloud; only the fields needed for routing are typed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(
        default,
        rename = "deviceId",
        alias = "device_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Request/response surface the negotiation needs from a signaling channel.
#[async_trait]
pub trait ActionChannel: Send + Sync {
    /// Sends `action` for `device_id` and waits for the correlated response.
    async fn action_request(&self, action: &str, device_id: &str, payload: Value)
    -> CloudResult<Value>;

    fn is_open(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, session: &Session) -> CloudResult<Arc<dyn ActionChannel>>;
}

struct PendingRequest {
    id: String,
    action: String,
    device_id: String,
    reply: oneshot::Sender<CloudResult<Value>>,
}

#[derive(Default)]
struct PendingTable {
    next_seq: u64,
    requests: BTreeMap<u64, PendingRequest>,
}

impl PendingTable {
    fn insert(&mut self, request: PendingRequest) -> CloudResult<u64> {
        if self
            .requests
            .values()
            .any(|pending| pending.action == request.action && pending.device_id == request.device_id)
        {
            return Err(CloudError::Signaling(format!(
                "{} already outstanding for device {}",
                request.action, request.device_id
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requests.insert(seq, request);
        Ok(seq)
    }

    /// A frame carrying an id matches that id or nothing; the request it
    /// answered may already have timed out. Frames without an id route by
    /// `(action, deviceId)` oldest-first, then by `action` when it is
    /// unambiguous.
    fn take_match(&mut self, frame: &InboundFrame) -> Option<PendingRequest> {
        let seq = match frame.id.as_deref() {
            Some(id) => self
                .requests
                .iter()
                .find(|(_, pending)| pending.id == id)
                .map(|(seq, _)| *seq),
            None => self.route_uncorrelated(frame),
        }?;
        self.requests.remove(&seq)
    }

    fn route_uncorrelated(&self, frame: &InboundFrame) -> Option<u64> {
        let action = frame.action.as_deref()?;
        match frame.device_id.as_deref() {
            Some(device_id) => self
                .requests
                .iter()
                .find(|(_, pending)| pending.action == action && pending.device_id == device_id)
                .map(|(seq, _)| *seq),
            None => {
                let mut matching = self
                    .requests
                    .iter()
                    .filter(|(_, pending)| pending.action == action);
                let first = matching.next().map(|(seq, _)| *seq);
                if matching.next().is_some() { None } else { first }
            }
        }
    }

    fn drain(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }
}

/// Signaling channel over a pair of text pipes.
///
/// [`SignalingChannel::from_parts`] runs it over any pipes;
/// [`WebSocketConnector`] bridges a websocket into them.
pub struct SignalingChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Arc<Mutex<PendingTable>>,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    log_wire_frames: bool,
    sent: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("request_timeout", &self.request_timeout)
            .field("log_wire_frames", &self.log_wire_frames)
            .field("sent", &self.sent.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SignalingChannel {
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Self::build(outbound, inbound, request_timeout, false)
    }

    fn build(
        outbound: mpsc::UnboundedSender<String>,
        mut inbound: mpsc::UnboundedReceiver<String>,
        request_timeout: Duration,
        log_wire_frames: bool,
    ) -> Arc<Self> {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                dispatch_inbound(&reader_pending, &text);
            }
            reader_closed.store(true, Ordering::SeqCst);
            cancel_all(&reader_pending, "signaling channel closed by peer");
        });

        Arc::new(Self {
            outbound: Mutex::new(Some(outbound)),
            pending,
            closed,
            request_timeout,
            log_wire_frames,
            sent: AtomicU64::new(0),
            tasks: Mutex::new(vec![reader]),
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of frames handed to the transport so far.
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    fn log_frame(&self, direction: &'static str, text: &str) {
        if self.log_wire_frames {
            tracing::debug!(target: "unifi_cloud::wire", direction, frame = text);
        } else {
            tracing::trace!(target: "unifi_cloud::wire", direction, frame = text);
        }
    }
}

fn dispatch_inbound(pending: &Mutex<PendingTable>, text: &str) {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(target: "unifi_cloud::signaling", error = %err, "dropping undecodable frame");
            return;
        }
    };
    // `"response": null` decodes as `None`; an id still marks it as a reply.
    if frame.id.is_none() && frame.response.is_none() && frame.error.is_none() {
        tracing::trace!(
            target: "unifi_cloud::signaling",
            action = ?frame.action,
            "ignoring unsolicited frame"
        );
        return;
    }

    let matched = pending.lock().take_match(&frame);
    match (matched, frame.error) {
        (Some(request), Some(error)) => {
            let _ = request.reply.send(Err(CloudError::Signaling(error_text(&error))));
        }
        (Some(request), None) => {
            tracing::debug!(
                target: "unifi_cloud::signaling",
                action = %request.action,
                device_id = %request.device_id,
                "response correlated"
            );
            let _ = request.reply.send(Ok(frame.response.unwrap_or(Value::Null)));
        }
        (None, Some(error)) if frame.id.is_none() && frame.device_id.is_none() => {
            let message = error_text(&error);
            tracing::warn!(target: "unifi_cloud::signaling", error = %message, "channel error frame");
            for request in pending.lock().drain() {
                let _ = request
                    .reply
                    .send(Err(CloudError::Signaling(message.clone())));
            }
        }
        (None, Some(error)) => {
            tracing::warn!(
                target: "unifi_cloud::signaling",
                id = ?frame.id,
                device_id = ?frame.device_id,
                error = %error_text(&error),
                "error frame matched no pending request"
            );
        }
        (None, None) => {
            tracing::warn!(
                target: "unifi_cloud::signaling",
                id = ?frame.id,
                action = ?frame.action,
                device_id = ?frame.device_id,
                "response matched no pending request"
            );
        }
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn cancel_all(pending: &Mutex<PendingTable>, reason: &str) {
    let drained = pending.lock().drain();
    if !drained.is_empty() {
        tracing::debug!(
            target: "unifi_cloud::signaling",
            pending = drained.len(),
            reason,
            "cancelling pending actions"
        );
    }
    for request in drained {
        let _ = request.reply.send(Err(CloudError::Cancelled(reason.to_string())));
    }
}

#[async_trait]
impl ActionChannel for SignalingChannel {
    async fn action_request(
        &self,
        action: &str,
        device_id: &str,
        payload: Value,
    ) -> CloudResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CloudError::Cancelled("signaling channel is closed".into()));
        }
        let frame = ActionFrame {
            id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: ActionEnvelope {
                device_id: device_id.to_string(),
                payload,
            },
        };
        let text = serde_json::to_string(&frame)
            .map_err(|err| CloudError::Signaling(format!("encode {action}: {err}")))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let seq = {
            let mut pending = self.pending.lock();
            // Closing flips the flag before draining under this lock.
            if self.closed.load(Ordering::SeqCst) {
                return Err(CloudError::Cancelled("signaling channel is closed".into()));
            }
            pending.insert(PendingRequest {
                id: frame.id.clone(),
                action: frame.action.clone(),
                device_id: device_id.to_string(),
                reply: reply_tx,
            })?
        };

        self.log_frame("out", &text);
        let delivered = match self.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(text).is_ok(),
            None => false,
        };
        if !delivered {
            self.pending.lock().requests.remove(&seq);
            return Err(CloudError::Cancelled("signaling writer has stopped".into()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            target: "unifi_cloud::signaling",
            action,
            device_id,
            id = %frame.id,
            "action sent"
        );

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CloudError::Cancelled("signaling channel dropped the request".into())),
            Err(_) => {
                self.pending.lock().requests.remove(&seq);
                tracing::warn!(
                    target: "unifi_cloud::signaling",
                    action,
                    device_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "action timed out"
                );
                Err(CloudError::SignalingTimeout {
                    action: action.to_string(),
                    device_id: device_id.to_string(),
                    after: self.request_timeout,
                })
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        cancel_all(&self.pending, "signaling channel disconnected");
        // Dropping the sender lets a websocket writer flush a close frame.
        self.outbound.lock().take();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::info!(target: "unifi_cloud::signaling", "signaling channel disconnected");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Opens the cloud websocket, presenting the session credential in the
/// handshake.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    request_timeout: Duration,
    log_wire_frames: bool,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
            log_wire_frames: false,
        }
    }

    pub fn log_wire_frames(mut self, enabled: bool) -> Self {
        self.log_wire_frames = enabled;
        self
    }

    pub async fn open(&self, session: &Session) -> CloudResult<Arc<SignalingChannel>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| CloudError::SignalingConnect(format!("invalid url {}: {err}", self.url)))?;
        let (name, value) = match &session.credential {
            SessionCredential::Cookie(cookie) => (COOKIE, cookie.clone()),
            SessionCredential::Bearer(token) => (AUTHORIZATION, format!("Bearer {token}")),
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|err| CloudError::SignalingConnect(format!("invalid session credential: {err}")))?;
        request.headers_mut().insert(name, value);

        // A server that accepts TCP but never answers the upgrade would
        // otherwise hang the negotiation before any round-trip bound applies.
        let (ws_stream, _) = tokio::time::timeout(self.request_timeout, connect_async(request))
            .await
            .map_err(|_| {
                CloudError::SignalingConnect(format!(
                    "websocket handshake with {} timed out after {:?}",
                    self.url, self.request_timeout
                ))
            })?
            .map_err(|err| CloudError::SignalingConnect(format!("websocket connect failed: {err}")))?;
        tracing::info!(target: "unifi_cloud::signaling", url = %self.url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "unifi_cloud::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "unifi_cloud::signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                if inbound_tx.send(text).is_err() {
                    break;
                }
            }
        });

        let channel = SignalingChannel::build(
            outbound_tx,
            inbound_rx,
            self.request_timeout,
            self.log_wire_frames,
        );
        channel.track(reader);
        drop(writer);
        Ok(channel)
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, session: &Session) -> CloudResult<Arc<dyn ActionChannel>> {
        let channel: Arc<dyn ActionChannel> = self.open(session).await?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeCloud {
        frames: mpsc::UnboundedReceiver<String>,
        replies: mpsc::UnboundedSender<String>,
    }

    impl FakeCloud {
        async fn next_frame(&mut self) -> ActionFrame {
            let text = self.frames.recv().await.expect("channel sent nothing");
            serde_json::from_str(&text).expect("outbound frame decodes")
        }

        fn reply(&self, value: Value) {
            self.replies.send(value.to_string()).expect("channel reader alive");
        }
    }

    fn channel(timeout: Duration) -> (Arc<SignalingChannel>, FakeCloud) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::from_parts(out_tx, in_rx, timeout);
        (
            channel,
            FakeCloud {
                frames: out_rx,
                replies: in_tx,
            },
        )
    }

    #[tokio::test]
    async fn response_is_correlated_by_id() {
        let (channel, mut cloud) = channel(Duration::from_secs(5));
        let request = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                channel
                    .action_request(SDP_EXCHANGE, "dev-1", json!({ "type": "OFFER" }))
                    .await
            }
        });

        let frame = cloud.next_frame().await;
        assert_eq!(frame.action, SDP_EXCHANGE);
        assert_eq!(frame.payload.device_id, "dev-1");
        assert_eq!(frame.payload.payload["type"], "OFFER");
        cloud.reply(json!({ "id": frame.id, "response": { "webRtcId": "w1" } }));

        let response = request.await.unwrap().unwrap();
        assert_eq!(response["webRtcId"], "w1");
        assert_eq!(channel.frames_sent(), 1);
    }

    #[tokio::test]
    async fn out_of_order_responses_route_by_device() {
        let (channel, mut cloud) = channel(Duration::from_secs(5));
        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-a", json!({})).await }
        });
        cloud.next_frame().await;
        let second = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-b", json!({})).await }
        });
        cloud.next_frame().await;

        cloud.reply(json!({ "action": SDP_EXCHANGE, "deviceId": "dev-b", "response": { "who": "b" } }));
        cloud.reply(json!({ "action": SDP_EXCHANGE, "deviceId": "dev-a", "response": { "who": "a" } }));

        assert_eq!(first.await.unwrap().unwrap()["who"], "a");
        assert_eq!(second.await.unwrap().unwrap()["who"], "b");
    }

    #[test]
    fn action_alone_routes_only_when_unambiguous() {
        let mut table = PendingTable::default();
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        table
            .insert(PendingRequest {
                id: "a".into(),
                action: SDP_EXCHANGE.into(),
                device_id: "dev-a".into(),
                reply: tx_a,
            })
            .unwrap();
        let frame = InboundFrame {
            action: Some(SDP_EXCHANGE.into()),
            response: Some(Value::Null),
            ..Default::default()
        };
        table
            .insert(PendingRequest {
                id: "b".into(),
                action: SDP_EXCHANGE.into(),
                device_id: "dev-b".into(),
                reply: tx_b,
            })
            .unwrap();
        assert!(table.take_match(&frame).is_none());

        let by_device = InboundFrame {
            device_id: Some("dev-b".into()),
            ..frame.clone()
        };
        assert_eq!(table.take_match(&by_device).unwrap().id, "b");
        assert_eq!(table.take_match(&frame).unwrap().id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_to_timed_out_request_is_dropped() {
        let (channel, mut cloud) = channel(Duration::from_secs(3));
        let expired = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-a", json!({})).await }
        });
        let stale = cloud.next_frame().await;
        assert!(matches!(
            expired.await.unwrap(),
            Err(CloudError::SignalingTimeout { .. })
        ));

        let current = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-b", json!({})).await }
        });
        let frame = cloud.next_frame().await;
        // Same action, only dev-b pending: the stale id must not fall back to it.
        cloud.reply(json!({ "id": stale.id, "action": SDP_EXCHANGE, "response": { "who": "a" } }));
        cloud.reply(json!({ "id": stale.id, "action": SDP_EXCHANGE, "error": "device a gone" }));
        cloud.reply(json!({ "id": frame.id, "response": { "who": "b" } }));

        assert_eq!(current.await.unwrap().unwrap()["who"], "b");
    }

    #[tokio::test]
    async fn null_response_resolves_the_request() {
        let (channel, mut cloud) = channel(Duration::from_secs(5));
        let request = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await }
        });
        let frame = cloud.next_frame().await;
        cloud.reply(json!({ "id": frame.id, "response": null }));

        assert_eq!(request.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn second_outstanding_request_for_device_is_rejected() {
        let (channel, mut cloud) = channel(Duration::from_secs(5));
        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await }
        });
        let frame = cloud.next_frame().await;

        let err = channel
            .action_request(SDP_EXCHANGE, "dev-1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Signaling(_)));

        cloud.reply(json!({ "id": frame.id, "response": {} }));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (channel, _cloud) = channel(Duration::from_secs(3));
        let err = channel
            .action_request(SDP_EXCHANGE, "dev-1", json!({}))
            .await
            .unwrap_err();
        match err {
            CloudError::SignalingTimeout { action, device_id, after } => {
                assert_eq!(action, SDP_EXCHANGE);
                assert_eq!(device_id, "dev-1");
                assert_eq!(after, Duration::from_secs(3));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // The timed-out request no longer blocks a retry for the same device.
        assert!(channel.pending.lock().requests.is_empty());
    }

    #[tokio::test]
    async fn error_frames_fail_requests() {
        let (channel, mut cloud) = channel(Duration::from_secs(5));
        let correlated = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await }
        });
        let frame = cloud.next_frame().await;
        cloud.reply(json!({ "id": frame.id, "error": { "message": "device offline" } }));
        match correlated.await.unwrap().unwrap_err() {
            CloudError::Signaling(message) => assert_eq!(message, "device offline"),
            other => panic!("unexpected {other:?}"),
        }

        let broadcast = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-2", json!({})).await }
        });
        cloud.next_frame().await;
        cloud.reply(json!({ "error": "rate limited" }));
        assert!(matches!(
            broadcast.await.unwrap().unwrap_err(),
            CloudError::Signaling(_)
        ));

        // An error naming another device leaves this request alone.
        let bystander = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-3", json!({})).await }
        });
        let frame = cloud.next_frame().await;
        cloud.reply(json!({ "action": SDP_EXCHANGE, "deviceId": "dev-9", "error": "unknown device" }));
        cloud.reply(json!({ "id": frame.id, "response": { "ok": true } }));
        assert_eq!(bystander.await.unwrap().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_and_is_idempotent() {
        let (channel, mut cloud) = channel(Duration::from_secs(30));
        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await }
        });
        cloud.next_frame().await;

        channel.disconnect().await;
        channel.disconnect().await;

        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            CloudError::Cancelled(_)
        ));
        assert!(!channel.is_open());
        assert!(matches!(
            channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await,
            Err(CloudError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn peer_close_cancels_pending() {
        let (channel, mut cloud) = channel(Duration::from_secs(30));
        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.action_request(SDP_EXCHANGE, "dev-1", json!({})).await }
        });
        cloud.next_frame().await;
        drop(cloud);

        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            CloudError::Cancelled(_)
        ));
        assert!(!channel.is_open());

        let err = channel
            .action_request(SDP_EXCHANGE, "dev-2", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Cancelled(_)));
        assert!(channel.pending.lock().requests.is_empty());
        assert_eq!(channel.frames_sent(), 1);
    }
}
