use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use viva_types::event::TokenUsage;
use viva_types::record::{
    Interview, InterviewStatus, JoinRecord, Persona, Session, SessionStatus, TurnMessage,
};

use crate::store::Store;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS personas (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                prompt      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS interviews (
                id          TEXT PRIMARY KEY,
                persona_id  TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'in_progress',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id           TEXT PRIMARY KEY,
                interview_id TEXT NOT NULL REFERENCES interviews(id),
                upstream_id  TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'active',
                started_at   TEXT NOT NULL,
                ended_at     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_interview ON sessions(interview_id, started_at);

            CREATE TABLE IF NOT EXISTS join_records (
                id           TEXT PRIMARY KEY,
                user_id      TEXT NOT NULL,
                interview_id TEXT NOT NULL REFERENCES interviews(id),
                session_id   TEXT NOT NULL REFERENCES sessions(id),
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_join_user ON join_records(user_id, created_at);

            CREATE TABLE IF NOT EXISTS messages (
                id           TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL REFERENCES sessions(id),
                interview_id TEXT NOT NULL REFERENCES interviews(id),
                role         TEXT NOT NULL,
                content      TEXT NOT NULL,
                token_input  INTEGER,
                token_output INTEGER,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_interview ON messages(interview_id, created_at);

            CREATE TABLE IF NOT EXISTS usage_totals (
                interview_id TEXT PRIMARY KEY REFERENCES interviews(id),
                token_input  INTEGER NOT NULL DEFAULT 0,
                token_output INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }
}

impl Store for SqliteStore {
    // --- Personas ---

    fn persona(&self, id: &str) -> Result<Option<Persona>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, prompt FROM personas WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Persona {
                id: row.get(0)?,
                name: row.get(1)?,
                prompt: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    fn upsert_persona(&self, persona: &Persona) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO personas (id, name, prompt) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = ?2, prompt = ?3",
            params![persona.id, persona.name, persona.prompt],
        )?;
        Ok(())
    }

    // --- Interviews ---

    fn create_interview(&self, interview: &Interview) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO interviews (id, persona_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                interview.id.to_string(),
                interview.persona_id,
                interview.status.to_string(),
                interview.created_at.to_rfc3339(),
                interview.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn interview(&self, id: Uuid) -> Result<Option<Interview>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, persona_id, status, created_at, updated_at
             FROM interviews WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_interview(row)?)),
            None => Ok(None),
        }
    }

    fn update_interview_status(&self, id: Uuid, status: InterviewStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE interviews SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                status.to_string(),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    // --- Sessions ---

    fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, interview_id, upstream_id, status, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.to_string(),
                session.interview_id.to_string(),
                session.upstream_id,
                session.status.to_string(),
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn session(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, interview_id, upstream_id, status, started_at, ended_at
             FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    fn sessions(&self, interview_id: Uuid) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, interview_id, upstream_id, status, started_at, ended_at
             FROM sessions WHERE interview_id = ?1 ORDER BY started_at ASC",
        )?;
        let mut rows = stmt.query(params![interview_id.to_string()])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    fn update_session_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let ended_at = status
            .is_terminal()
            .then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = COALESCE(?2, ended_at) WHERE id = ?3",
            params![status.to_string(), ended_at, id.to_string()],
        )?;
        Ok(())
    }

    // --- Join records ---

    fn create_join_record(&self, join: &JoinRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO join_records (id, user_id, interview_id, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                join.id.to_string(),
                join.user_id,
                join.interview_id.to_string(),
                join.session_id.to_string(),
                join.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // --- Turn messages ---

    fn append_turn_message(&self, message: &TurnMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, session_id, interview_id, role, content,
                                   token_input, token_output, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                message.session_id.to_string(),
                message.interview_id.to_string(),
                message.role.to_string(),
                message.content,
                message.token_input,
                message.token_output,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn turn_messages(&self, interview_id: Uuid) -> Result<Vec<TurnMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, interview_id, role, content,
                    token_input, token_output, created_at
             FROM messages WHERE interview_id = ?1 ORDER BY created_at ASC",
        )?;
        let mut rows = stmt.query(params![interview_id.to_string()])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let session_id: String = row.get(1)?;
            let interview_id: String = row.get(2)?;
            let role: String = row.get(3)?;
            let created_at: String = row.get(7)?;
            messages.push(TurnMessage {
                id: id.parse().context("invalid message id")?,
                session_id: session_id.parse().context("invalid session id")?,
                interview_id: interview_id.parse().context("invalid interview id")?,
                role: role.parse().context("invalid role")?,
                content: row.get(4)?,
                token_input: row.get(5)?,
                token_output: row.get(6)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?
                    .with_timezone(&Utc),
            });
        }
        Ok(messages)
    }

    // --- Usage aggregate ---

    fn usage(&self, interview_id: Uuid) -> Result<TokenUsage> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT token_input, token_output FROM usage_totals WHERE interview_id = ?1",
        )?;
        let mut rows = stmt.query(params![interview_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(TokenUsage {
                input: row.get(0)?,
                output: row.get(1)?,
            }),
            None => Ok(TokenUsage::default()),
        }
    }

    fn set_usage(&self, interview_id: Uuid, usage: TokenUsage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO usage_totals (interview_id, token_input, token_output)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(interview_id) DO UPDATE SET token_input = ?2, token_output = ?3",
            params![interview_id.to_string(), usage.input, usage.output],
        )?;
        Ok(())
    }
}

fn row_to_interview(row: &rusqlite::Row<'_>) -> Result<Interview> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(Interview {
        id: id.parse().context("invalid interview id")?,
        persona_id: row.get(1)?,
        status: status.parse().context("invalid interview status")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session> {
    let id: String = row.get(0)?;
    let interview_id: String = row.get(1)?;
    let status: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let ended_at: Option<String> = row.get(5)?;
    Ok(Session {
        id: id.parse().context("invalid session id")?,
        interview_id: interview_id.parse().context("invalid interview id")?,
        upstream_id: row.get(2)?,
        status: status.parse().context("invalid session status")?,
        started_at: chrono::DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        ended_at: ended_at
            .map(|t| chrono::DateTime::parse_from_rfc3339(&t).map(|t| t.with_timezone(&Utc)))
            .transpose()?,
    })
}
