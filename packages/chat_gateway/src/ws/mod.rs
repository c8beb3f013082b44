//! WebSocket session transport
//!
//! One task per socket that:
//! - Forwards relayed events from the instance's local broadcast
//! - Hands inbound text frames to the gateway
//! - Detaches the session when the socket closes or the instance shuts down

mod handler;

pub use handler::handle_session;
