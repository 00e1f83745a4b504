#![doc = include_str!("../README.md")]

pub mod context;
pub mod dark;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod netfile;
pub mod relay;
pub mod router;
pub mod socket;

pub use context::InstrumentCtx;
pub use dispatch::{ClientEvent, ExitReason, ExternalClient};
pub use error::{CommsError, DeviceError};
pub use instrument::{Devices, Instrument, MockConfig};
pub use router::{Broadcast, Router};
pub use socket::{ClientLink, SocketServer};

pub use plumelink_shared::{codec, Code, CommandSet, RoleId, Value};
