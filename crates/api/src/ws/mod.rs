//! WebSocket surface: connection registry, the upgrade handler with its
//! request dispatcher, and the heartbeat.
//!
//! Each connection is a channel; its id is generated at upgrade time and
//! announced to the client in the first frame.

mod handler;
mod heartbeat;
pub mod manager;
pub mod protocol;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
