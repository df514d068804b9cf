//! # evsim-station
//!
//! The core of an OCPP 1.6-J charging-station simulator: one [`Station`]
//! per simulated charge point, impersonating the station side of the
//! protocol toward a Central System over WebSocket.
//!
//! The station owns:
//! - the connector table and per-connector transaction state,
//! - the ordered OCPP configuration key store,
//! - the RPC transport (correlation, timeouts, offline buffering and the
//!   boot admission gate),
//! - the session controller (connect, boot handshake, heartbeat, ping,
//!   reconnect backoff, file watching),
//! - the command dispatcher servicing Central-System-initiated actions,
//! - and one meter sampler per charging connector.
//!
//! The supervising process that instantiates N stations, the transaction
//! generator driver and the log subscriber are out of scope and plug in
//! through [`Station::set_transaction_generator`] and the `tracing`
//! facade.

pub mod commands;
pub mod config_store;
pub mod connector;
pub mod error;
pub mod generator;
pub mod meter;
pub mod session;
pub mod station;
pub mod template;
pub mod transport;

pub use config_store::{ConfigStore, ConfigurationKey};
pub use connector::Connector;
pub use error::{StationError, StationResult};
pub use generator::TransactionGenerator;
pub use station::Station;
pub use template::{StationInfo, StationTemplate};
pub use transport::{OutboundFrame, RpcTransport};
