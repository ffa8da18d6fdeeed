//! Delivery of engine events to WebSocket clients.

mod forwarder;

pub use forwarder::BulkEventForwarder;
