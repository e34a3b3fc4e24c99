use serde::{Deserialize, Serialize};
use std::fmt;

use crate::peer::types::Descriptor;

/// Opaque room id, assigned by the store or chosen by the caller
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Joined,
    Negotiating,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// `None` while the caller is still waiting on the store
    pub id: Option<SessionId>,
    pub role: Role,
    pub local_descriptor: Option<Descriptor>,
    pub remote_descriptor: Option<Descriptor>,
    pub phase: SessionPhase,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            id: None,
            role,
            local_descriptor: None,
            remote_descriptor: None,
            phase: match role {
                Role::Caller => SessionPhase::Created,
                Role::Callee => SessionPhase::Joined,
            },
        }
    }

    pub fn is_live(&self) -> bool {
        self.phase != SessionPhase::Ended
    }

    /// Moves a fresh session on to Negotiating. A session that already went
    /// Active stays there.
    pub fn enter_negotiating(&mut self) {
        if matches!(self.phase, SessionPhase::Created | SessionPhase::Joined) {
            self.phase = SessionPhase::Negotiating;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_start_in_their_own_phase() {
        assert_eq!(Session::new(Role::Caller).phase, SessionPhase::Created);
        assert_eq!(Session::new(Role::Callee).phase, SessionPhase::Joined);
    }

    #[test]
    fn negotiating_never_downgrades_active() {
        let mut session = Session::new(Role::Callee);
        session.enter_negotiating();
        assert_eq!(session.phase, SessionPhase::Negotiating);

        session.phase = SessionPhase::Active;
        session.enter_negotiating();
        assert_eq!(session.phase, SessionPhase::Active);

        session.phase = SessionPhase::Ended;
        session.enter_negotiating();
        assert!(!session.is_live());
    }
}
