//! Graph state management

/// Graph state machine
///
/// `Stopped → Playing → Terminated`, nothing else. Terminated is
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphState {
    /// Graph assembled but not started
    #[default]
    Stopped,

    /// Transport connected (or connecting) and data flowing
    Playing,

    /// Torn down; nothing runs any more
    Terminated,
}

impl GraphState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &GraphState) -> bool {
        use GraphState::*;

        matches!(
            (self, target),
            (Stopped, Playing) | (Playing, Terminated)
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            GraphState::Stopped => "Stopped",
            GraphState::Playing => "Playing",
            GraphState::Terminated => "Terminated",
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, GraphState::Playing)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, GraphState::Terminated)
    }
}

impl std::fmt::Display for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
