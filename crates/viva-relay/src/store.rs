use anyhow::Result;
use uuid::Uuid;

use viva_types::event::TokenUsage;
use viva_types::record::{
    Interview, InterviewStatus, JoinRecord, Persona, Session, SessionStatus, TurnMessage,
};

/// The persistent store consumed by the lifecycle manager and the relay.
/// A trait so tests can substitute failing or counting doubles; the shipped
/// implementation is [`crate::SqliteStore`].
pub trait Store: Send + Sync {
    // Personas
    fn persona(&self, id: &str) -> Result<Option<Persona>>;
    fn upsert_persona(&self, persona: &Persona) -> Result<()>;

    // Interviews
    fn create_interview(&self, interview: &Interview) -> Result<()>;
    fn interview(&self, id: Uuid) -> Result<Option<Interview>>;
    fn update_interview_status(&self, id: Uuid, status: InterviewStatus) -> Result<()>;

    // Sessions
    fn create_session(&self, session: &Session) -> Result<()>;
    fn session(&self, id: Uuid) -> Result<Option<Session>>;
    fn sessions(&self, interview_id: Uuid) -> Result<Vec<Session>>;
    /// Terminal statuses also stamp `ended_at`.
    fn update_session_status(&self, id: Uuid, status: SessionStatus) -> Result<()>;

    // Join records
    fn create_join_record(&self, join: &JoinRecord) -> Result<()>;

    // Turn messages
    fn append_turn_message(&self, message: &TurnMessage) -> Result<()>;
    fn turn_messages(&self, interview_id: Uuid) -> Result<Vec<TurnMessage>>;

    // Usage aggregate (read-then-increment lives in the caller)
    fn usage(&self, interview_id: Uuid) -> Result<TokenUsage>;
    fn set_usage(&self, interview_id: Uuid, usage: TokenUsage) -> Result<()>;
}
