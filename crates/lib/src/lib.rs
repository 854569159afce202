//! carlink core library: command codec, device bridge, and the WebSocket gateway
//! used by the relay CLI.

pub mod bridge;
pub mod command;
pub mod config;
pub mod gateway;
