//! Consumer side of the messaging core: a reconciling cache
//! ([`DeliveryClient`]) and the connection manager that feeds it
//! ([`Session`]).

pub mod backoff;
pub mod config;
pub mod delivery;
pub mod error;
pub mod session;

pub use config::ClientConfig;
pub use delivery::{DeliveryClient, SyncState};
pub use error::ClientError;
pub use session::Session;
