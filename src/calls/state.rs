//! Call state machine.

use serde::Serialize;

/// Where our participation in a call stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallState {
    /// Known locally, nothing done yet.
    #[default]
    Initial,
    /// The call exists but we are not in it.
    ClientNotParticipating,
    /// Fetching the relay url or waiting for the relay socket.
    Connecting,
    /// `JOIN` sent, waiting for `ANSWER`.
    Joining,
    InProgress,
    /// Leaving: releasing sessions and the relay connection.
    TerminatingParticipation,
    /// Terminal. Everything has been released.
    Destroyed,
}

impl CallState {
    pub fn is_participating(&self) -> bool {
        matches!(self, Self::Connecting | Self::Joining | Self::InProgress)
    }

    pub fn can_join(&self) -> bool {
        matches!(self, Self::Initial | Self::ClientNotParticipating)
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Transitions are forward-only, except that a participating call may
    /// drop back to `ClientNotParticipating` when the connection is lost for
    /// good, and to `Connecting` while the relay link is being re-established.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Initial, ClientNotParticipating | Connecting) => true,
            (ClientNotParticipating, Connecting) => true,
            (Connecting, Joining | ClientNotParticipating | TerminatingParticipation) => true,
            (Joining, InProgress | Connecting | ClientNotParticipating | TerminatingParticipation) => {
                true
            }
            (InProgress, Connecting | ClientNotParticipating | TerminatingParticipation) => true,
            (TerminatingParticipation, ClientNotParticipating) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: CallState) -> Result<(), InvalidTransition> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut state = CallState::Initial;
        for next in [
            CallState::Connecting,
            CallState::Joining,
            CallState::InProgress,
            CallState::TerminatingParticipation,
            CallState::ClientNotParticipating,
            CallState::Connecting,
            CallState::Destroyed,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_destroyed());
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let mut state = CallState::Destroyed;
        assert!(state.transition(CallState::Initial).is_err());
        assert!(state.transition(CallState::Destroyed).is_err());
    }

    #[test]
    fn test_no_backward_jumps() {
        let mut state = CallState::InProgress;
        let err = state.transition(CallState::Joining).unwrap_err();
        assert_eq!(err.from, CallState::InProgress);
        assert_eq!(state, CallState::InProgress);

        assert!(!CallState::ClientNotParticipating.can_transition_to(CallState::InProgress));
        assert!(!CallState::TerminatingParticipation.can_transition_to(CallState::Connecting));
    }

    #[test]
    fn test_fallbacks() {
        assert!(CallState::InProgress.can_transition_to(CallState::ClientNotParticipating));
        assert!(CallState::Joining.can_transition_to(CallState::ClientNotParticipating));
        assert!(CallState::InProgress.can_transition_to(CallState::Connecting));
    }

    #[test]
    fn test_join_allowed_states() {
        assert!(CallState::Initial.can_join());
        assert!(CallState::ClientNotParticipating.can_join());
        assert!(!CallState::InProgress.can_join());
        assert!(!CallState::Destroyed.can_join());
    }
}
