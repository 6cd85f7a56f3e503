//! candr-core: driver for Canon DR, CR and P- series document
//! scanners over SCSI and USB.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: control-block layouts, window descriptors, sense
//!   translation. Pure, no I/O.
//! - **Transport**: the wire traits, the command channel with USB
//!   envelope framing and recovery, nusb and mock implementations.
//! - **Device**: INQUIRY/VPD interrogation, the model quirk table,
//!   and the attach/detach registry.
//! - **Session**: the scan state machine driving calibration, window
//!   programming and the read loop.
//! - **Calib**: analog-front-end and per-pixel calibration.
//! - **Image**: de-interlacing, correction and resampling of raw
//!   sensor bytes.
//! - **Post**: software deskew, crop and despeckle on buffered pages.
//!
//! # Example
//!
//! ```no_run
//! use candr_core::config::DriverConfig;
//! use candr_core::device::registry::Registry;
//! use candr_core::device::Connection;
//! use candr_core::session::{ReadOutcome, Session};
//! use candr_core::transport::usb::UsbBulk;
//! use candr_core::transport::{Channel, FramingOptions};
//!
//! let config = DriverConfig::default();
//! let bulk = UsbBulk::open(0x1607).expect("no scanner");
//! let mut channel = Channel::packetized(
//!     Box::new(bulk),
//!     FramingOptions { padded_read: config.padded_read, extra_status: config.extra_status },
//! );
//!
//! let mut registry = Registry::new();
//! let device = registry
//!     .attach("usb:04a9:1607", Connection::Usb, &mut channel, &config)
//!     .expect("attach failed")
//!     .clone();
//!
//! let mut session = Session::new(device, channel);
//! session.start().expect("start failed");
//! let mut buf = vec![0u8; 65536];
//! loop {
//!     match session.read(&mut buf).expect("read failed") {
//!         ReadOutcome::Data(n) => { /* consume buf[..n] */ }
//!         ReadOutcome::EndOfSide => break,
//!     }
//! }
//! ```

pub mod calib;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod post;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use calib::CalibrationState;
pub use config::DriverConfig;
pub use device::registry::{Device, Registry};
pub use device::{Connection, DeviceModel};
pub use error::ScanError;
pub use image::{ColorInterlace, DuplexInterlace, GrayInterlace, Mode, Side};
pub use session::{ReadOutcome, ScanSettings, Session, SessionPhase, Source};
pub use transport::{Channel, Command, FramingOptions, TransportError};
