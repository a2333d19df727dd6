use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use viva_agent::{extract_text, extract_usage, AgentGateway, AgentTurnRequest, NewMessage};
use viva_types::event::TokenUsage;
use viva_types::record::{Interview, TurnMessage};
use viva_types::relay::{RelayFrame, TurnOutcome, TurnRequest};

use crate::error::RelayError;
use crate::store::Store;

/// The public entry point for one chat turn: carries it upstream, re-emits
/// the event stream to the caller, and persists the completed turn.
pub struct TurnRelay {
    store: Arc<dyn Store>,
    gateway: Arc<dyn AgentGateway>,
    app_name: String,
    /// Maximum gap between successive upstream events.
    idle_timeout: Duration,
}

/// Outcome of validation: the loaded interview plus the parsed local
/// session id.
struct ValidTurn {
    interview: Interview,
    session_id: Uuid,
}

impl TurnRelay {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn AgentGateway>,
        app_name: String,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            app_name,
            idle_timeout,
        }
    }

    /// Reject before any upstream call: every id must be present, the
    /// interview must exist, and its persona binding must still resolve.
    fn validate(&self, req: &TurnRequest) -> Result<ValidTurn, RelayError> {
        let fields = [
            ("message", &req.message),
            ("userId", &req.user_id),
            ("sessionId", &req.session_id),
            ("upstreamSessionId", &req.upstream_session_id),
            ("interviewId", &req.interview_id),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(RelayError::Validation(name));
            }
        }
        let session_id = Uuid::parse_str(&req.session_id)
            .map_err(|_| RelayError::Validation("sessionId"))?;
        let interview_id = Uuid::parse_str(&req.interview_id)
            .map_err(|_| RelayError::Validation("interviewId"))?;

        let interview = self
            .store
            .interview(interview_id)
            .map_err(RelayError::Persistence)?
            .ok_or_else(|| RelayError::InterviewNotFound(req.interview_id.clone()))?;
        let persona = self
            .store
            .persona(&interview.persona_id)
            .map_err(RelayError::Persistence)?;
        if persona.is_none() {
            return Err(RelayError::MissingAgentBinding);
        }
        Ok(ValidTurn {
            interview,
            session_id,
        })
    }

    fn agent_request(&self, req: &TurnRequest, persona_id: &str, streaming: bool) -> AgentTurnRequest {
        AgentTurnRequest {
            app_name: self.app_name.clone(),
            user_id: req.user_id.clone(),
            session_id: req.upstream_session_id.clone(),
            persona_id: persona_id.to_string(),
            new_message: NewMessage::user(&req.message),
            streaming,
        }
    }

    /// Streaming mode. Frames go out through `tx` as upstream events are
    /// decoded; each forward completes before the next upstream read, so
    /// the caller's transport provides the backpressure. A validation
    /// failure returns `Err` before any frame; once frames have flowed,
    /// failures arrive in-band as an `error` frame and the call returns Ok.
    pub async fn stream_turn(
        &self,
        req: &TurnRequest,
        tx: mpsc::Sender<RelayFrame>,
    ) -> Result<(), RelayError> {
        let valid = self.validate(req)?;
        let request = self.agent_request(req, &valid.interview.persona_id, true);

        let mut events = match self.gateway.stream_turn(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("upstream turn failed before any event: {}", e);
                let _ = tx.send(RelayFrame::Error { error: e.to_string() }).await;
                return Ok(());
            }
        };

        let mut transcript = String::new();
        let mut usage: Option<TokenUsage> = None;

        loop {
            let next = match timeout(self.idle_timeout, events.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("upstream idle for {:?}, abandoning turn", self.idle_timeout);
                    let _ = tx
                        .send(RelayFrame::Error {
                            error: "upstream agent service timed out".to_string(),
                        })
                        .await;
                    return Ok(());
                }
            };
            match next {
                Some(Ok(event)) => {
                    for fragment in event.text_fragments() {
                        transcript.push_str(fragment);
                    }
                    let frame = match event.token_usage() {
                        Some(u) => {
                            // First usage-bearing event wins, matching the
                            // batch path's extraction.
                            usage.get_or_insert(u);
                            RelayFrame::Done {
                                event,
                                interview_id: Some(valid.interview.id),
                            }
                        }
                        None => RelayFrame::Message { event },
                    };
                    if tx.send(frame).await.is_err() {
                        // Caller disconnected. Stop reading upstream and
                        // drop the partial turn rather than persisting it.
                        info!("caller left mid-stream, abandoning turn");
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    warn!("upstream stream error: {}", e);
                    let _ = tx.send(RelayFrame::Error { error: e.to_string() }).await;
                    return Ok(());
                }
                None => break,
            }
        }

        let Some(usage) = usage else {
            warn!(
                "interview {}: stream ended without usage, turn not persisted",
                valid.interview.id
            );
            return Ok(());
        };

        if let Err(e) = self.persist_turn(req, &valid, &transcript, usage) {
            error!("failed to persist turn: {:#}", e);
            // The transcript was already delivered and is never retracted;
            // the caller just learns it may not have been saved.
            let _ = tx
                .send(RelayFrame::Error {
                    error: format!("your answer was delivered but may not be saved: {e}"),
                })
                .await;
        }
        Ok(())
    }

    /// Batch mode: drain the whole turn, persist, return the aggregate.
    /// Nothing has been shown to the caller yet, so persistence failure
    /// fails the entire request.
    pub async fn send_turn(&self, req: &TurnRequest) -> Result<TurnOutcome, RelayError> {
        let valid = self.validate(req)?;
        let request = self.agent_request(req, &valid.interview.persona_id, false);

        let events = self.gateway.send_turn(request).await?;
        let reply = extract_text(&events);
        let usage = extract_usage(&events);

        if let Some(u) = usage {
            self.persist_turn(req, &valid, &reply, u)
                .map_err(RelayError::Persistence)?;
        } else {
            warn!(
                "interview {}: batch turn carried no usage, not persisted",
                valid.interview.id
            );
        }
        Ok(TurnOutcome {
            interview_id: valid.interview.id,
            reply,
            usage,
        })
    }

    /// User turn, then assistant turn with its counts, then the aggregate.
    /// The aggregate is read-then-replaced; turns are serialized per
    /// session so there is no concurrent writer.
    fn persist_turn(
        &self,
        req: &TurnRequest,
        valid: &ValidTurn,
        transcript: &str,
        usage: TokenUsage,
    ) -> anyhow::Result<()> {
        let interview_id = valid.interview.id;

        let user_msg = TurnMessage::user(valid.session_id, interview_id, &req.message);
        self.store.append_turn_message(&user_msg)?;

        let mut reply = TurnMessage::assistant(valid.session_id, interview_id, transcript);
        reply.token_input = Some(usage.input);
        reply.token_output = Some(usage.output);
        self.store.append_turn_message(&reply)?;

        let totals = self.store.usage(interview_id)?;
        self.store.set_usage(
            interview_id,
            TokenUsage {
                input: totals.input + usage.input,
                output: totals.output + usage.output,
            },
        )?;
        info!(
            "interview {}: turn persisted ({} in / {} out tokens)",
            interview_id, usage.input, usage.output
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use futures_util::stream::{self, BoxStream};

    use viva_agent::GatewayError;
    use viva_types::event::AgentEvent;
    use viva_types::record::{
        InterviewStatus, JoinRecord, Persona, Session, SessionStatus, UpstreamSession,
    };

    use crate::db::SqliteStore;

    fn event(json: &str) -> AgentEvent {
        serde_json::from_str(json).unwrap()
    }

    fn three_event_turn() -> Vec<Result<AgentEvent, GatewayError>> {
        vec![
            Ok(event(r#"{"content":{"parts":[{"text":"I have "}]}}"#)),
            Ok(event(r#"{"content":{"parts":[{"text":"lived here forever."}]}}"#)),
            Ok(event(
                r#"{"content":{"parts":[{"text":""}]},
                    "usageMetadata":{"promptTokenCount":20,"candidatesTokenCount":8}}"#,
            )),
        ]
    }

    struct ScriptedUpstream {
        script: Mutex<Option<Vec<Result<AgentEvent, GatewayError>>>>,
        fail_open: bool,
    }

    impl ScriptedUpstream {
        fn with(script: Vec<Result<AgentEvent, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(Some(script)),
                fail_open: false,
            }
        }

        fn failing() -> Self {
            Self {
                script: Mutex::new(None),
                fail_open: true,
            }
        }
    }

    #[async_trait]
    impl AgentGateway for ScriptedUpstream {
        async fn create_session(
            &self,
            _app: &str,
            user_id: &str,
            _requested: Option<&str>,
        ) -> Result<UpstreamSession, GatewayError> {
            Ok(UpstreamSession {
                id: "up-1".into(),
                user_id: user_id.into(),
                last_update_time: None,
                state: serde_json::Value::Null,
            })
        }

        async fn delete_session(
            &self,
            _app: &str,
            _user: &str,
            _upstream: &str,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn stream_turn(
            &self,
            _request: AgentTurnRequest,
        ) -> Result<BoxStream<'static, Result<AgentEvent, GatewayError>>, GatewayError> {
            if self.fail_open {
                return Err(GatewayError::Upstream {
                    status: 503,
                    detail: "agent service down".into(),
                });
            }
            let script = self.script.lock().unwrap().take().expect("script consumed");
            Ok(stream::iter(script).boxed())
        }

        async fn send_turn(
            &self,
            _request: AgentTurnRequest,
        ) -> Result<Vec<AgentEvent>, GatewayError> {
            if self.fail_open {
                return Err(GatewayError::Upstream {
                    status: 503,
                    detail: "agent service down".into(),
                });
            }
            let script = self.script.lock().unwrap().take().expect("script consumed");
            script.into_iter().collect()
        }
    }

    /// Delegating store that fails every message write, for the
    /// persistence-failure-after-delivery property.
    struct BrokenMessageStore {
        inner: SqliteStore,
    }

    impl Store for BrokenMessageStore {
        fn persona(&self, id: &str) -> anyhow::Result<Option<Persona>> {
            self.inner.persona(id)
        }
        fn upsert_persona(&self, persona: &Persona) -> anyhow::Result<()> {
            self.inner.upsert_persona(persona)
        }
        fn create_interview(&self, interview: &Interview) -> anyhow::Result<()> {
            self.inner.create_interview(interview)
        }
        fn interview(&self, id: Uuid) -> anyhow::Result<Option<Interview>> {
            self.inner.interview(id)
        }
        fn update_interview_status(
            &self,
            id: Uuid,
            status: InterviewStatus,
        ) -> anyhow::Result<()> {
            self.inner.update_interview_status(id, status)
        }
        fn create_session(&self, session: &Session) -> anyhow::Result<()> {
            self.inner.create_session(session)
        }
        fn session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
            self.inner.session(id)
        }
        fn sessions(&self, interview_id: Uuid) -> anyhow::Result<Vec<Session>> {
            self.inner.sessions(interview_id)
        }
        fn update_session_status(&self, id: Uuid, status: SessionStatus) -> anyhow::Result<()> {
            self.inner.update_session_status(id, status)
        }
        fn create_join_record(&self, join: &JoinRecord) -> anyhow::Result<()> {
            self.inner.create_join_record(join)
        }
        fn append_turn_message(&self, _message: &TurnMessage) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn turn_messages(&self, interview_id: Uuid) -> anyhow::Result<Vec<TurnMessage>> {
            self.inner.turn_messages(interview_id)
        }
        fn usage(&self, interview_id: Uuid) -> anyhow::Result<TokenUsage> {
            self.inner.usage(interview_id)
        }
        fn set_usage(&self, interview_id: Uuid, usage: TokenUsage) -> anyhow::Result<()> {
            self.inner.set_usage(interview_id, usage)
        }
    }

    fn seeded_store() -> (SqliteStore, Interview, Uuid) {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_persona(&Persona {
                id: "elder".into(),
                name: "Village elder".into(),
                prompt: "You are a retired schoolteacher.".into(),
            })
            .unwrap();
        let now = Utc::now();
        let interview = Interview {
            id: Uuid::new_v4(),
            persona_id: "elder".into(),
            status: InterviewStatus::InProgress,
            created_at: now,
            updated_at: now,
        };
        store.create_interview(&interview).unwrap();
        let session = Session {
            id: Uuid::new_v4(),
            interview_id: interview.id,
            upstream_id: "up-1".into(),
            status: SessionStatus::Active,
            started_at: now,
            ended_at: None,
        };
        store.create_session(&session).unwrap();
        let session_id = session.id;
        (store, interview, session_id)
    }

    fn request(interview: &Interview, session_id: Uuid) -> TurnRequest {
        TurnRequest {
            message: "How long have you lived here?".into(),
            user_id: "student-1".into(),
            session_id: session_id.to_string(),
            upstream_session_id: "up-1".into(),
            interview_id: interview.id.to_string(),
            streaming: true,
        }
    }

    fn relay(store: Arc<dyn Store>, gateway: ScriptedUpstream) -> TurnRelay {
        TurnRelay::new(
            store,
            Arc::new(gateway),
            "viva".into(),
            Duration::from_secs(5),
        )
    }

    async fn collect_frames(
        relay: &TurnRelay,
        req: &TurnRequest,
    ) -> (Result<(), RelayError>, Vec<RelayFrame>) {
        let (tx, mut rx) = mpsc::channel(16);
        let result = relay.stream_turn(req, tx).await;
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        (result, frames)
    }

    #[tokio::test]
    async fn streaming_turn_forwards_and_persists() {
        let (store, interview, session_id) = seeded_store();
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::with(three_event_turn()));
        let req = request(&interview, session_id);

        let (result, frames) = collect_frames(&relay, &req).await;
        result.unwrap();

        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], RelayFrame::Message { .. }));
        assert!(matches!(frames[1], RelayFrame::Message { .. }));
        match &frames[2] {
            RelayFrame::Done { interview_id, .. } => {
                assert_eq!(*interview_id, Some(interview.id));
            }
            other => panic!("expected done frame, got {other:?}"),
        }

        let history = store.turn_messages(interview.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "I have lived here forever.");
        assert_eq!(history[1].token_input, Some(20));
        assert_eq!(history[1].token_output, Some(8));
        assert_eq!(
            store.usage(interview.id).unwrap(),
            TokenUsage {
                input: 20,
                output: 8
            }
        );
    }

    #[tokio::test]
    async fn streaming_keeps_first_usage_event() {
        let (store, interview, session_id) = seeded_store();
        let script = vec![
            Ok(event(r#"{"content":{"parts":[{"text":"answer"}]}}"#)),
            Ok(event(
                r#"{"usageMetadata":{"promptTokenCount":20,"candidatesTokenCount":8}}"#,
            )),
            Ok(event(
                r#"{"usageMetadata":{"promptTokenCount":99,"candidatesTokenCount":99}}"#,
            )),
        ];
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::with(script));
        let req = request(&interview, session_id);

        let (result, frames) = collect_frames(&relay, &req).await;
        result.unwrap();

        // Both usage-bearing events still go out as done frames.
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[1], RelayFrame::Done { .. }));
        assert!(matches!(frames[2], RelayFrame::Done { .. }));

        let history = store.turn_messages(interview.id).unwrap();
        assert_eq!(history[1].token_input, Some(20));
        assert_eq!(history[1].token_output, Some(8));
        assert_eq!(
            store.usage(interview.id).unwrap(),
            TokenUsage {
                input: 20,
                output: 8
            }
        );
    }

    #[tokio::test]
    async fn usage_aggregate_accumulates_across_turns() {
        let (store, interview, session_id) = seeded_store();
        let store = Arc::new(store);
        let req = request(&interview, session_id);

        for _ in 0..2 {
            let relay = relay(store.clone(), ScriptedUpstream::with(three_event_turn()));
            let (result, _) = collect_frames(&relay, &req).await;
            result.unwrap();
        }
        assert_eq!(
            store.usage(interview.id).unwrap(),
            TokenUsage {
                input: 40,
                output: 16
            }
        );
    }

    #[tokio::test]
    async fn persistence_failure_arrives_after_the_transcript() {
        let (store, interview, session_id) = seeded_store();
        let relay = relay(
            Arc::new(BrokenMessageStore { inner: store }),
            ScriptedUpstream::with(three_event_turn()),
        );
        let req = request(&interview, session_id);

        let (result, frames) = collect_frames(&relay, &req).await;
        result.unwrap();

        // Order matters: the full transcript precedes the failure notice.
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], RelayFrame::Message { .. }));
        assert!(matches!(frames[1], RelayFrame::Message { .. }));
        assert!(matches!(frames[2], RelayFrame::Done { .. }));
        match &frames[3] {
            RelayFrame::Error { error } => assert!(error.contains("disk full")),
            other => panic!("expected trailing error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_failure_before_events_is_a_single_error_frame() {
        let (store, interview, session_id) = seeded_store();
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::failing());
        let req = request(&interview, session_id);

        let (result, frames) = collect_frames(&relay, &req).await;
        result.unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], RelayFrame::Error { .. }));
        assert!(store.turn_messages(interview.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn mid_stream_upstream_error_is_forwarded() {
        let (store, interview, session_id) = seeded_store();
        let script = vec![
            Ok(event(r#"{"content":{"parts":[{"text":"partial"}]}}"#)),
            Err(GatewayError::Upstream {
                status: 502,
                detail: "upstream hiccup".into(),
            }),
        ];
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::with(script));
        let req = request(&interview, session_id);

        let (result, frames) = collect_frames(&relay, &req).await;
        result.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], RelayFrame::Message { .. }));
        assert!(matches!(frames[1], RelayFrame::Error { .. }));
        // No usage arrived, so nothing was persisted.
        assert!(store.turn_messages(interview.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_rejects_each_missing_field_before_upstream() {
        let (store, interview, session_id) = seeded_store();
        let store: Arc<dyn Store> = Arc::new(store);
        let base = request(&interview, session_id);

        let cases: Vec<(&str, Box<dyn Fn(&mut TurnRequest)>)> = vec![
            ("message", Box::new(|r| r.message.clear())),
            ("userId", Box::new(|r| r.user_id.clear())),
            ("sessionId", Box::new(|r| r.session_id.clear())),
            (
                "upstreamSessionId",
                Box::new(|r| r.upstream_session_id.clear()),
            ),
            ("interviewId", Box::new(|r| r.interview_id.clear())),
        ];
        for (field, mutate) in cases {
            // A fresh gateway each time: its script must remain untouched.
            let gateway = ScriptedUpstream::with(three_event_turn());
            let relay = TurnRelay::new(
                store.clone(),
                Arc::new(gateway),
                "viva".into(),
                Duration::from_secs(5),
            );
            let mut req = base.clone();
            mutate(&mut req);
            let (tx, _rx) = mpsc::channel(16);
            match relay.stream_turn(&req, tx).await {
                Err(RelayError::Validation(name)) => assert_eq!(name, field),
                other => panic!("expected validation error for {field}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unknown_interview_rejected() {
        let (store, interview, session_id) = seeded_store();
        let relay = relay(Arc::new(store), ScriptedUpstream::with(three_event_turn()));
        let mut req = request(&interview, session_id);
        req.interview_id = Uuid::new_v4().to_string();

        let (tx, _rx) = mpsc::channel(16);
        let err = relay.stream_turn(&req, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::InterviewNotFound(_)));
    }

    #[tokio::test]
    async fn missing_persona_binding_rejected() {
        let (store, _interview, session_id) = seeded_store();
        let now = Utc::now();
        let orphan = Interview {
            id: Uuid::new_v4(),
            persona_id: "deleted".into(),
            status: InterviewStatus::InProgress,
            created_at: now,
            updated_at: now,
        };
        store.create_interview(&orphan).unwrap();
        let relay = relay(Arc::new(store), ScriptedUpstream::with(three_event_turn()));
        let mut req = request(&orphan, session_id);
        req.interview_id = orphan.id.to_string();

        let (tx, _rx) = mpsc::channel(16);
        let err = relay.stream_turn(&req, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::MissingAgentBinding));
    }

    #[tokio::test]
    async fn batch_turn_returns_aggregate_and_persists() {
        let (store, interview, session_id) = seeded_store();
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::with(three_event_turn()));
        let mut req = request(&interview, session_id);
        req.streaming = false;

        let outcome = relay.send_turn(&req).await.unwrap();
        assert_eq!(outcome.reply, "I have lived here forever.");
        assert_eq!(
            outcome.usage,
            Some(TokenUsage {
                input: 20,
                output: 8
            })
        );
        assert_eq!(store.turn_messages(interview.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_persistence_failure_fails_the_request() {
        let (store, interview, session_id) = seeded_store();
        let relay = relay(
            Arc::new(BrokenMessageStore { inner: store }),
            ScriptedUpstream::with(three_event_turn()),
        );
        let mut req = request(&interview, session_id);
        req.streaming = false;

        let err = relay.send_turn(&req).await.unwrap_err();
        assert!(matches!(err, RelayError::Persistence(_)));
    }

    #[tokio::test]
    async fn caller_disconnect_stops_the_turn_without_persisting() {
        let (store, interview, session_id) = seeded_store();
        let store = Arc::new(store);
        let relay = relay(store.clone(), ScriptedUpstream::with(three_event_turn()));
        let req = request(&interview, session_id);

        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        relay.stream_turn(&req, tx).await.unwrap();
        assert!(store.turn_messages(interview.id).unwrap().is_empty());
        assert_eq!(store.usage(interview.id).unwrap(), TokenUsage::default());
    }
}
