pub mod connection;
pub mod handler;
pub mod message;

pub use connection::{Connection, WsConnection};
pub use handler::{ClientSession, ConnectionLifecycleHandler};
pub use message::{ClientMessage, OutboundEvent};
