use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Connecting,
    Monitoring,
    /// Connection lost; reconnecting.
    Degraded { attempt: u32 },
    Stopped,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Connecting => "connecting",
            EngineState::Monitoring => "monitoring",
            EngineState::Degraded { .. } => "degraded",
            EngineState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(&self, next: &EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Stopped, Connecting)
                | (Connecting, Monitoring)
                | (Monitoring, Degraded { .. })
                | (Degraded { .. }, Degraded { .. })
                | (Degraded { .. }, Monitoring)
                | (Idle, Stopped)
                | (Connecting, Stopped)
                | (Monitoring, Stopped)
                | (Degraded { .. }, Stopped)
        )
    }

    /// Whether leader activity should be forwarded to followers.
    pub fn forwards_signals(&self) -> bool {
        matches!(self, EngineState::Monitoring | EngineState::Degraded { .. })
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, EngineState::Idle | EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Degraded { attempt } => write!(f, "degraded(attempt {attempt})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Owner of an engine's current state. Every transition is validated.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<EngineState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EngineState::Idle);
        Self { tx }
    }

    pub fn current(&self) -> EngineState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<EngineState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: EngineState) -> Result<EngineState, EngineError> {
        let mut previous = None;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(&next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        previous.ok_or_else(|| EngineError::InvalidTransition {
            from: self.current(),
            to: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let lc = Lifecycle::new();
        assert_eq!(lc.transition(EngineState::Connecting).unwrap(), EngineState::Idle);
        lc.transition(EngineState::Monitoring).unwrap();
        lc.transition(EngineState::Degraded { attempt: 1 }).unwrap();
        lc.transition(EngineState::Degraded { attempt: 2 }).unwrap();
        lc.transition(EngineState::Monitoring).unwrap();
        lc.transition(EngineState::Stopped).unwrap();
        lc.transition(EngineState::Connecting).unwrap();
        assert_eq!(lc.current(), EngineState::Connecting);
    }

    #[test]
    fn invalid_transition_is_an_error() {
        let lc = Lifecycle::new();
        let err = lc.transition(EngineState::Monitoring).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { from: EngineState::Idle, to: EngineState::Monitoring }
        ));
        assert_eq!(lc.current(), EngineState::Idle);
        lc.transition(EngineState::Stopped).unwrap();
        assert!(lc.transition(EngineState::Stopped).is_err());
    }

    #[test]
    fn state_serializes_with_tag() {
        let json = serde_json::to_value(EngineState::Degraded { attempt: 3 }).unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["attempt"], 3);
    }
}
