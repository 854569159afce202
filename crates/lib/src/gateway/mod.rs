//! Gateway: HTTP + WebSocket front of the relay.
//!
//! Single port serves HTTP and WebSocket. Each WebSocket is one session; the query
//! string names the device (`?ip=..&port=..`). Frames are JSON: heartbeats and commands
//! in, status, device data, pongs and errors out.

mod protocol;
mod server;
mod session;

pub use protocol::{ClientMessage, ConnectQuery, ServerMessage};
pub use server::{router, run_relay, serve, RelayState};
pub use session::{device_address, SessionError, SessionGateway};
