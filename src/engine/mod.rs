pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod relay;
pub mod state;

pub use events::{ErrorEvent, RelayEvent, RelayStats, Reporter, StatsSnapshot};
pub use lifecycle::{EngineState, Lifecycle};
pub use registry::RelayRegistry;
pub use relay::{EngineStatus, RelayConfig, RelayEngine, RelayEngineBuilder};
pub use state::{RelayState, SharedState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("relay for leader {0} is already running")]
    AlreadyRunning(String),

    #[error("credential {got} does not belong to leader {expected}")]
    LeaderMismatch { expected: String, got: String },

    #[error("follower {follower_id} is linked to leader {leader_id}, not this relay")]
    ForeignLink {
        follower_id: String,
        leader_id: String,
    },

    #[error("account {0} cannot follow itself")]
    SelfFollow(String),

    #[error("no relay registered for leader {0}")]
    UnknownRelay(String),
}
