use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One overall simulated interview. Created once, resumed across any number
/// of sessions; the persona binding never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interview {
    pub id: Uuid,
    pub persona_id: String,
    pub status: InterviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    InProgress,
    Completed,
    Abandoned,
    Error,
}

impl std::fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for InterviewStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            "error" => Ok(Self::Error),
            _ => Err(anyhow::anyhow!("unknown interview status: {}", s)),
        }
    }
}

/// One logical connection window within an interview. At most one session
/// per interview should be `active` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub interview_id: Uuid,
    /// Id of the paired upstream session. The pairing is 1:1 at creation
    /// but the upstream side may outlive us if deletion fails.
    pub upstream_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Abandoned,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            "abandoned" => Ok(Self::Abandoned),
            "error" => Ok(Self::Error),
            _ => Err(anyhow::anyhow!("unknown session status: {}", s)),
        }
    }
}

/// The agent service's own session handle, as returned by its create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSession {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<f64>,
    /// Opaque state blob; never inspected locally.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub state: serde_json::Value,
}

/// Associates a caller with an interview and one of its sessions. Written
/// once per session creation, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRecord {
    pub id: Uuid,
    pub user_id: String,
    pub interview_id: Uuid,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A configured interviewee identity the upstream agent assumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub prompt: String,
}

/// One stored message of a turn (user or assistant half).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub interview_id: Uuid,
    pub role: Role,
    pub content: String,
    pub token_input: Option<i64>,
    pub token_output: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TurnMessage {
    pub fn user(session_id: Uuid, interview_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            interview_id,
            role: Role::User,
            content: content.into(),
            token_input: None,
            token_output: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(session_id: Uuid, interview_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            interview_id,
            role: Role::Assistant,
            content: content.into(),
            token_input: None,
            token_output: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(anyhow::anyhow!("unknown role: {}", s)),
        }
    }
}
