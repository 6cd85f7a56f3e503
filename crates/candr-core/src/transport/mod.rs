//! Transport layer: wire traits, the command-execution channel, and
//! concrete implementations (nusb, mock).

pub mod channel;
pub mod mock;
pub mod traits;
pub mod usb;

pub use channel::{Channel, Command, FramingOptions, Response};
pub use traits::{BlockResponse, BlockTransport, BulkTransport, TransportError};
