pub mod config;
pub mod connection;
pub mod identity;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;
