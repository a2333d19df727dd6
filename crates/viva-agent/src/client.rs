use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use viva_types::event::AgentEvent;
use viva_types::record::UpstreamSession;
use viva_types::wire::FrameDecoder;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("agent service returned {status}: {detail}")]
    Upstream { status: u16, detail: String },
    #[error("agent service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed agent response: {0}")]
    Decode(#[from] serde_json::Error),
}

// ─── Request types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurnRequest {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub persona_id: String,
    pub new_message: NewMessage,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub role: String,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePart {
    pub text: String,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![MessagePart { text: text.into() }],
        }
    }
}

// ─── Gateway trait ────────────────────────────────────────────────────────────

/// The outbound leg to the upstream agent service. A trait so the relay
/// takes an injected instance and tests can script the upstream without a
/// network.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Mint an upstream session. One blocking round trip.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        requested_id: Option<&str>,
    ) -> Result<UpstreamSession, GatewayError>;

    /// Tear down an upstream session. Callers treat failures as
    /// log-and-continue; local cleanup never waits on this succeeding.
    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        upstream_id: &str,
    ) -> Result<(), GatewayError>;

    /// Send one turn as an incremental event stream. The stream is finite
    /// and not restartable; calling again issues a new upstream turn.
    async fn stream_turn(
        &self,
        request: AgentTurnRequest,
    ) -> Result<BoxStream<'static, Result<AgentEvent, GatewayError>>, GatewayError>;

    /// Send one turn fully buffered.
    async fn send_turn(&self, request: AgentTurnRequest)
        -> Result<Vec<AgentEvent>, GatewayError>;
}

// ─── HTTP client ──────────────────────────────────────────────────────────────

pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            request_timeout,
        })
    }

    fn sessions_url(&self, app_name: &str, user_id: &str) -> String {
        format!("{}/apps/{}/users/{}/sessions", self.base_url, app_name, user_id)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl AgentGateway for HttpAgentClient {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        requested_id: Option<&str>,
    ) -> Result<UpstreamSession, GatewayError> {
        let mut url = self.sessions_url(app_name, user_id);
        if let Some(id) = requested_id {
            url = format!("{url}/{id}");
        }
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let session: UpstreamSession = response.json().await?;
        debug!("created upstream session {}", session.id);
        Ok(session)
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        upstream_id: &str,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/{}", self.sessions_url(app_name, user_id), upstream_id);
        let response = self
            .client
            .delete(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn stream_turn(
        &self,
        mut request: AgentTurnRequest,
    ) -> Result<BoxStream<'static, Result<AgentEvent, GatewayError>>, GatewayError> {
        request.streaming = true;
        let url = format!("{}/run_sse", self.base_url);
        let response = self
            .client
            .post(&url)
            // Only stream-open is bounded here; per-event gaps are the
            // relay's idle timeout to enforce.
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(decode_stream(response.bytes_stream()).boxed())
    }

    async fn send_turn(
        &self,
        mut request: AgentTurnRequest,
    ) -> Result<Vec<AgentEvent>, GatewayError> {
        request.streaming = false;
        let url = format!("{}/run", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let events: Vec<AgentEvent> = response.json().await?;
        Ok(events)
    }
}

// ─── Stream decoding ──────────────────────────────────────────────────────────

struct DecodeState<S> {
    body: S,
    decoder: FrameDecoder<AgentEvent>,
    pending: VecDeque<AgentEvent>,
    failed: bool,
}

/// Turn a raw byte stream into decoded events, yielding each event as soon
/// as its frame completes rather than waiting for the body to end.
fn decode_stream<S, B>(body: S) -> impl Stream<Item = Result<AgentEvent, GatewayError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    let state = DecodeState {
        body,
        decoder: FrameDecoder::new(),
        pending: VecDeque::new(),
        failed: false,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.failed {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.pending.extend(st.decoder.feed(chunk.as_ref())),
                Some(Err(e)) => {
                    st.failed = true;
                    return Some((Err(GatewayError::Transport(e)), st));
                }
                None => {
                    let residual = std::mem::take(&mut st.decoder).finish();
                    if residual > 0 {
                        warn!("discarding {residual} bytes of truncated trailing frame");
                    }
                    return None;
                }
            }
        }
    })
}
