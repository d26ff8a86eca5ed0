use shared::domain::TeacherCode;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Joining,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentIdentity {
    pub teacher_code: TeacherCode,
    pub student_name: String,
}

impl StudentIdentity {
    /// Validates raw login-form input. Rejected input never reaches the wire.
    pub fn parse(teacher_code: &str, student_name: &str) -> Result<Self, ClientError> {
        let teacher_code: TeacherCode = teacher_code
            .parse()
            .map_err(|_| ClientError::validation("teacher code must be exactly 6 digits"))?;
        let student_name = student_name.trim();
        if student_name.is_empty() {
            return Err(ClientError::validation("student name must not be empty"));
        }
        Ok(Self {
            teacher_code,
            student_name: student_name.to_string(),
        })
    }
}

/// Teacher credentials arrive pre-authenticated from the login collaborator;
/// this core only carries them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherIdentity {
    pub teacher_code: TeacherCode,
    pub teacher_name: String,
}

/// One client's connection lifecycle. Join attempts are tagged with a
/// generation so a result belonging to a superseded attempt is discarded
/// instead of moving the machine.
pub struct SessionManager<I> {
    state: ConnectionState,
    generation: u64,
    identity: Option<I>,
}

impl<I: Clone> SessionManager<I> {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn identity(&self) -> Option<&I> {
        self.identity.as_ref()
    }

    /// Starts a join attempt and returns its generation tag. Allowed from
    /// `Disconnected` and from `Joining` (a fresh attempt supersedes the
    /// outstanding one); a connected session must disconnect first.
    pub fn begin_join(&mut self, identity: I) -> Result<u64, ClientError> {
        if self.state == ConnectionState::Connected {
            return Err(ClientError::protocol("already connected"));
        }
        self.generation += 1;
        self.state = ConnectionState::Joining;
        self.identity = Some(identity);
        Ok(self.generation)
    }

    /// Applies a join success for the tagged attempt. Returns `false` (and
    /// leaves the machine alone) when the attempt was superseded.
    pub fn complete_join(&mut self, generation: u64) -> bool {
        if self.state == ConnectionState::Joining && self.generation == generation {
            self.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Applies a join rejection for the tagged attempt.
    pub fn fail_join(&mut self, generation: u64) -> bool {
        if self.state == ConnectionState::Joining && self.generation == generation {
            self.state = ConnectionState::Disconnected;
            true
        } else {
            false
        }
    }

    /// Transport loss, kick, or explicit leave. Returns whether the state
    /// actually changed. `Disconnected` is re-enterable via `begin_join`.
    pub fn force_disconnect(&mut self) -> bool {
        let changed = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        changed
    }
}

impl<I: Clone> Default for SessionManager<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_walks_disconnected_joining_connected() {
        let mut session = SessionManager::<StudentIdentity>::new();
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let identity = StudentIdentity::parse("123456", "Kim").expect("identity");
        let generation = session.begin_join(identity).expect("begin");
        assert_eq!(session.state(), ConnectionState::Joining);

        assert!(session.complete_join(generation));
        assert!(session.is_connected());
    }

    #[test]
    fn stale_join_results_are_discarded() {
        let mut session = SessionManager::<StudentIdentity>::new();
        let identity = StudentIdentity::parse("123456", "Kim").expect("identity");

        let first = session.begin_join(identity.clone()).expect("begin");
        let second = session.begin_join(identity).expect("begin again");
        assert_ne!(first, second);

        // A late rejection of the first attempt must not move the machine.
        assert!(!session.fail_join(first));
        assert_eq!(session.state(), ConnectionState::Joining);

        assert!(session.complete_join(second));
        assert!(session.is_connected());
    }

    #[test]
    fn join_rejection_returns_to_disconnected() {
        let mut session = SessionManager::<StudentIdentity>::new();
        let identity = StudentIdentity::parse("123456", "Kim").expect("identity");
        let generation = session.begin_join(identity.clone()).expect("begin");
        assert!(session.fail_join(generation));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // Re-enterable afterwards.
        session.begin_join(identity).expect("fresh attempt");
    }

    #[test]
    fn connected_sessions_reject_a_second_join() {
        let mut session = SessionManager::<StudentIdentity>::new();
        let identity = StudentIdentity::parse("123456", "Kim").expect("identity");
        let generation = session.begin_join(identity.clone()).expect("begin");
        assert!(session.complete_join(generation));
        assert!(session.begin_join(identity).is_err());
    }

    #[test]
    fn force_disconnect_reports_whether_anything_changed() {
        let mut session = SessionManager::<StudentIdentity>::new();
        assert!(!session.force_disconnect());

        let identity = StudentIdentity::parse("123456", "Kim").expect("identity");
        let generation = session.begin_join(identity).expect("begin");
        assert!(session.complete_join(generation));
        assert!(session.force_disconnect());
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn student_identity_validation_rejects_bad_input() {
        assert!(StudentIdentity::parse("12345", "Kim").is_err());
        assert!(StudentIdentity::parse("abcdef", "Kim").is_err());
        assert!(StudentIdentity::parse("123456", "   ").is_err());

        let identity = StudentIdentity::parse("123456", "  Kim  ").expect("identity");
        assert_eq!(identity.student_name, "Kim");
    }
}
