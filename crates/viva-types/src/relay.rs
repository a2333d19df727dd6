use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{AgentEvent, TokenUsage};

/// One frame of the relay's own caller-facing stream, re-emitted with the
/// same `data: <json>` convention the upstream speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    /// Incremental event forwarded as-is from upstream.
    Message { event: AgentEvent },
    /// Terminal event of the turn (the one carrying usage).
    Done {
        event: AgentEvent,
        #[serde(
            rename = "interviewId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        interview_id: Option<Uuid>,
    },
    /// Upstream or storage failure, delivered in-band.
    Error { error: String },
}

fn default_streaming() -> bool {
    true
}

/// One chat turn as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub message: String,
    pub user_id: String,
    /// Local session id.
    pub session_id: String,
    pub upstream_session_id: String,
    pub interview_id: String,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

/// Aggregate result of a batch-mode turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub interview_id: Uuid,
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_with_expected_tags() {
        let ev: AgentEvent =
            serde_json::from_str(r#"{"content":{"parts":[{"text":"hi"}]}}"#).unwrap();
        let frame = RelayFrame::Message { event: ev.clone() };
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "message");
        assert_eq!(v["event"]["content"]["parts"][0]["text"], "hi");

        let id = Uuid::new_v4();
        let done = RelayFrame::Done {
            event: ev,
            interview_id: Some(id),
        };
        let v = serde_json::to_value(&done).unwrap();
        assert_eq!(v["type"], "done");
        assert_eq!(v["interviewId"], id.to_string());

        let err = RelayFrame::Error {
            error: "boom".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], "boom");
    }

    #[test]
    fn turn_request_defaults_to_streaming() {
        let req: TurnRequest = serde_json::from_str(
            r#"{"message":"hi","userId":"u1","sessionId":"s1",
                "upstreamSessionId":"up1","interviewId":"i1"}"#,
        )
        .unwrap();
        assert!(req.streaming);
    }
}
