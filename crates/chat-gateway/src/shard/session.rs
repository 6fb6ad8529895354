//! Resumable session state
//!
//! The session id and sequence number are the only state carried across
//! reconnects.

use crate::protocol::{ReadyPayload, ResumePayload};
use chat_core::Snowflake;

/// Session state kept by a shard between connections
#[derive(Debug, Clone, Default)]
pub struct Session {
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
    user_id: Option<Snowflake>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful identify
    pub fn ready(&mut self, ready: &ReadyPayload) {
        self.session_id = Some(ready.session_id.clone());
        self.resume_url.clone_from(&ready.resume_gateway_url);
        self.user_id = Some(ready.user.id);
    }

    /// Track the last sequence number seen
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    /// Forget the session so the next connection identifies
    ///
    /// The own user id survives; it is needed to filter voice state events.
    pub fn clear(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }

    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Build a Resume payload when the session can be resumed
    #[must_use]
    pub fn resume_payload(&self, token: &str) -> Option<ResumePayload> {
        match (&self.session_id, self.sequence) {
            (Some(session_id), Some(seq)) => Some(ResumePayload {
                token: token.to_string(),
                session_id: session_id.clone(),
                seq,
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    #[must_use]
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Snowflake> {
        self.user_id
    }
}
