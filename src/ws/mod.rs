//! WebSocket gateway and wire protocol

pub mod handler;
pub mod protocol;
pub mod sockets;
pub mod stream;

pub use handler::play_handler;
pub use sockets::{SocketCommand, SocketRegistry};
