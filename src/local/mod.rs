mod listener;
mod socket;

pub use listener::{AcceptedConnection, ActiveGuard, BindError, LocalListener};
pub use socket::{ConnectionLost, EndpointId, LocalSocket, ReadGate, SocketEvent, SocketOptions};
