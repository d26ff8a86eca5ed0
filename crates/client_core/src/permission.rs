use tracing::debug;

/// The single shared "students may reply" switch. Unknown until the server
/// has communicated a value, and unknown means disallowed, never
/// default-allow.
#[derive(Debug, Default)]
pub struct PermissionGate {
    state: Option<bool>,
}

impl PermissionGate {
    pub fn allows_student_send(&self) -> bool {
        self.state == Some(true)
    }

    pub fn is_known(&self) -> bool {
        self.state.is_some()
    }

    /// Applies a server-communicated value. Returns whether the effective
    /// answer changed; redundant applications report `false` so the caller
    /// can suppress duplicate confirmations.
    pub fn apply(&mut self, allow: bool) -> bool {
        let changed = self.allows_student_send() != allow;
        if !changed && self.state.is_none() {
            debug!(allow, "permission gate confirmed its default");
        }
        self.state = Some(allow);
        changed
    }

    /// Back to unknown (and therefore deny), e.g. after a disconnect.
    pub fn reset(&mut self) -> bool {
        let was_allowing = self.allows_student_send();
        self.state = None;
        was_allowing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_until_the_server_has_spoken() {
        let gate = PermissionGate::default();
        assert!(!gate.allows_student_send());
        assert!(!gate.is_known());
    }

    #[test]
    fn apply_reports_visible_changes_only() {
        let mut gate = PermissionGate::default();
        assert!(!gate.apply(false), "deny -> deny is not a visible change");
        assert!(gate.apply(true));
        assert!(!gate.apply(true), "redundant toggle");
        assert!(gate.apply(false));
    }

    #[test]
    fn reset_returns_to_default_deny() {
        let mut gate = PermissionGate::default();
        gate.apply(true);
        assert!(gate.reset());
        assert!(!gate.allows_student_send());
        assert!(!gate.is_known());
    }
}
