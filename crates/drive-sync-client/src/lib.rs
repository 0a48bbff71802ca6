//! Realtime client for the drive: one managed websocket, heartbeat and
//! reconnect, event routing into the shared stores, plus the REST calls the
//! chat flow needs.

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod machine;
pub mod manager;
pub mod rest;
pub mod session;

pub use backoff::ReconnectPolicy;
pub use error::ClientError;
pub use machine::{ConnectionMachine, Effect, Input, Phase};
pub use manager::{ConnectionManager, ConnectionSettings, ConnectionStatus};
pub use rest::DriveApi;
pub use session::{ChatSession, SubmitError};
