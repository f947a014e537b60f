pub mod bus;
pub mod connection;
pub mod hub;
pub mod presence;
pub mod sweeper;
pub mod typing;

pub use bus::RealtimeBus;
pub use hub::Hub;
