//! Control-plane access: remote object model, gateway trait, REST session and
//! the session pool

pub mod gateway;
pub mod pool;
pub mod rest;
pub mod types;

pub use gateway::ObjectGateway;
pub use pool::{ConnectionKey, ConnectionPool, Connector, RestConnector};
pub use rest::RestClient;
