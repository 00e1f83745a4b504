#![doc = include_str!("../README.md")]

pub mod codec;
pub mod command;
pub mod frame;
pub mod role;
pub mod schema;
pub mod value;

pub use command::CommandSet;
pub use frame::FrameBuffer;
pub use role::RoleId;
pub use schema::{Code, Kind, SchemaEntry};
pub use value::Value;

/// Sentinel that ends every frame on the wire.
pub const TERMINATOR: &[u8] = b"END\r\n";

/// Legacy length-header prefix. Retained for reference; no message path
/// sends or expects a header.
pub const LEGACY_HEADER_PREFIX: &str = "H_DATASIZE=";

/// Digits in the legacy length header's size field.
pub const LEGACY_HEADER_DIGITS: usize = 8;

/// Ports the instrument server tries, in order, when none are configured.
pub const DEFAULT_PORTS: [u16; 3] = [12345, 12346, 12347];
