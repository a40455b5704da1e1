pub mod address;
pub mod cache;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod native;
pub mod session;
pub mod settings;
pub mod target;
pub mod transfer;
pub mod transport;
pub mod workflow;

#[cfg(feature = "impl-russh")]
pub mod ssh_russh;

pub use error::{Result, TransportError};
