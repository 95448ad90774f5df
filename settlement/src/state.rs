//! Engine lifecycle states.

/// Settlement engine operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting requests and settling withdrawals.
    Running,
    /// Refusing new requests, waiting for in-flight settlements.
    Draining,
    /// Shut down.
    Stopped,
}

impl EngineState {
    /// Check if the engine is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, EngineState::Running)
    }
}
