//! Bulk actions API server library.
//!
//! Config, state, error mapping, routes and the WebSocket layer, shared by
//! the binary entrypoint and the integration tests.

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod notifications;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
