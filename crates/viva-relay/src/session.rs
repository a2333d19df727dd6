use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use viva_agent::AgentGateway;
use viva_types::record::{
    Interview, InterviewStatus, JoinRecord, Session, SessionStatus, UpstreamSession,
};

use crate::error::LifecycleError;
use crate::store::Store;

/// Everything a caller needs to start sending turns.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub interview: Interview,
    pub session: Session,
    pub upstream: UpstreamSession,
}

/// Owns the interview/session/join lifecycle: new interviews, resumes, and
/// teardown. One active session per live client connection; an interview
/// accumulates sessions across resumes.
pub struct SessionManager {
    store: Arc<dyn Store>,
    gateway: Arc<dyn AgentGateway>,
    app_name: String,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn AgentGateway>, app_name: String) -> Self {
        Self {
            store,
            gateway,
            app_name,
        }
    }

    /// Start a brand-new interview bound to `persona_id`.
    pub async fn start_interview(
        &self,
        user_id: &str,
        persona_id: &str,
    ) -> Result<SessionHandle, LifecycleError> {
        self.store
            .persona(persona_id)
            .map_err(LifecycleError::Persistence)?
            .ok_or_else(|| LifecycleError::InvalidPersona(persona_id.to_string()))?;

        let now = Utc::now();
        let interview = Interview {
            id: Uuid::new_v4(),
            persona_id: persona_id.to_string(),
            status: InterviewStatus::InProgress,
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_interview(&interview)
            .map_err(LifecycleError::Persistence)?;
        info!("created interview {} (persona {})", interview.id, persona_id);

        self.open_session(user_id, interview).await
    }

    /// Resume an existing interview with a fresh session. The persona comes
    /// from the interview's own binding, never from the caller.
    pub async fn resume_interview(
        &self,
        user_id: &str,
        interview_id: Uuid,
    ) -> Result<SessionHandle, LifecycleError> {
        let interview = self
            .store
            .interview(interview_id)
            .map_err(LifecycleError::Persistence)?
            .ok_or(LifecycleError::InterviewNotFound(interview_id))?;
        self.store
            .persona(&interview.persona_id)
            .map_err(LifecycleError::Persistence)?
            .ok_or(LifecycleError::PersonaMissing(interview_id))?;

        info!("resuming interview {}", interview_id);
        self.open_session(user_id, interview).await
    }

    /// Mint the upstream session, then write the local session and join
    /// record. Upstream failure aborts before anything local is written, so
    /// no half-created session/join rows exist.
    async fn open_session(
        &self,
        user_id: &str,
        interview: Interview,
    ) -> Result<SessionHandle, LifecycleError> {
        let upstream = self
            .gateway
            .create_session(&self.app_name, user_id, None)
            .await?;

        let session = Session {
            id: Uuid::new_v4(),
            interview_id: interview.id,
            upstream_id: upstream.id.clone(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.store
            .create_session(&session)
            .map_err(LifecycleError::Persistence)?;

        let join = JoinRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            interview_id: interview.id,
            session_id: session.id,
            created_at: Utc::now(),
        };
        self.store
            .create_join_record(&join)
            .map_err(LifecycleError::Persistence)?;

        info!(
            "session {} active (interview {}, upstream {})",
            session.id, interview.id, upstream.id
        );
        Ok(SessionHandle {
            interview,
            session,
            upstream,
        })
    }

    /// End a session. Idempotent: a session already in a terminal state
    /// no-ops. The upstream delete is attempted first but its failure never
    /// blocks the local transition — the caller is leaving regardless.
    pub async fn end_session(
        &self,
        user_id: &str,
        session_id: Uuid,
        upstream_id: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let Some(session) = self
            .store
            .session(session_id)
            .map_err(LifecycleError::Persistence)?
        else {
            warn!("end_session: unknown session {}", session_id);
            return Ok(());
        };
        if session.status.is_terminal() {
            return Ok(());
        }

        // Prefer the caller-supplied upstream id, then the stored pairing,
        // then the local id as a last resort.
        let upstream_ref = match upstream_id {
            Some(id) => id.to_string(),
            None if !session.upstream_id.is_empty() => session.upstream_id.clone(),
            None => session.id.to_string(),
        };
        if let Err(e) = self
            .gateway
            .delete_session(&self.app_name, user_id, &upstream_ref)
            .await
        {
            warn!("upstream session delete failed (continuing): {}", e);
        }

        self.store
            .update_session_status(session.id, SessionStatus::Ended)
            .map_err(LifecycleError::Persistence)?;
        info!("session {} ended", session.id);
        Ok(())
    }

    /// Mark an interview finished, after its last session has ended. A
    /// completed interview can still be resumed later; resuming does not
    /// reset the status.
    pub fn complete_interview(&self, interview_id: Uuid) -> Result<(), LifecycleError> {
        self.store
            .update_interview_status(interview_id, InterviewStatus::Completed)
            .map_err(LifecycleError::Persistence)?;
        info!("interview {} completed", interview_id);
        Ok(())
    }
}
