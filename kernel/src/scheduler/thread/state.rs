//! Thread lifecycle states.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but not yet forked onto the ready queue.
    JustCreated,
    /// In the ready queue, waiting for the processor.
    Ready,
    /// Holding the processor.
    Running,
    /// Off the queue, waiting for an external wake.
    Blocked,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JustCreated => write!(f, "just-created"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// Legal lifecycle transitions.
pub fn validate_transition(from: ThreadState, to: ThreadState) -> bool {
    use ThreadState::*;

    matches!(
        (from, to),
        (JustCreated, Ready)
            | (Ready, Running)
            | (Running, Ready)
            | (Running, Blocked)
            | (Blocked, Ready)
    )
}

#[cfg(test)]
mod tests {
    use super::ThreadState::*;
    use super::*;

    #[test]
    fn lifecycle_transitions_are_permitted() {
        assert!(validate_transition(JustCreated, Ready));
        assert!(validate_transition(Ready, Running));
        assert!(validate_transition(Running, Ready));
        assert!(validate_transition(Running, Blocked));
        assert!(validate_transition(Blocked, Ready));
    }

    #[test]
    fn shortcuts_are_rejected() {
        assert!(!validate_transition(JustCreated, Running));
        assert!(!validate_transition(Blocked, Running));
        assert!(!validate_transition(Ready, Blocked));
        assert!(!validate_transition(Blocked, Blocked));
    }
}
