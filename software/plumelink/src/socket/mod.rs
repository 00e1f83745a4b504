//! TCP transport for the instrument network: framed connections, the
//! connection registry, the listening server and the client.

pub mod client;
pub mod connection;
pub mod registry;
pub mod server;

pub use client::{connect_any, connect_with_timeout, ClientLink};
pub use connection::{Connection, FrameReader};
pub use registry::Registry;
pub use server::{Ingress, SlotState, SocketServer};
