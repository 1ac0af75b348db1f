pub mod api;
pub mod config;
pub mod context;
pub mod delivery;
pub mod error;
pub mod events;
pub mod fs_ops;
pub mod gateway;
pub mod handshake;
pub mod origins;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod supervisor;
pub mod tunnel;
