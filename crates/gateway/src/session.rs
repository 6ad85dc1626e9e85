//! Per-connection session state.

/// Mutable session context owned by the gateway connection.
///
/// `seq` tracks the last dispatched event sequence; `session_id` and
/// `resume_url` arrive with the READY event. Created with the connection
/// and destroyed on close.
#[derive(Debug, Default)]
pub struct SessionContext {
    pub seq: u64,
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
}

impl SessionContext {
    /// Whether the next Hello should be answered with Resume rather than
    /// Identify. Evaluated fresh on every Hello.
    pub fn can_resume(&self) -> bool {
        self.seq > 0 && self.session_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Clears the resumable fields after an Invalid Session signal.
    pub fn invalidate(&mut self) {
        self.seq = 0;
        self.session_id = None;
    }
}
