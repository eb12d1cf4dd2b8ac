//! WebSocket endpoints: the agent event-protocol channel and the requester
//! gateway.

pub mod gateway;

pub use gateway::{agent_handler, requester_handler};
