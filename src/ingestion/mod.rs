pub mod connector;
pub mod normalizer;
pub mod poller;
pub mod stream;

pub use connector::{
    build_connector, ConnectionStatus, ConnectorConfig, ConnectorError, ConnectorEvent,
    ConnectorMode, ConnectorSession, LeaderConnector, RawMessage,
};
pub use normalizer::{DedupSet, MalformedSignal, SignalNormalizer};
