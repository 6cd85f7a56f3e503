//! Scan lifecycle: parameters, tone curve, and the session state
//! machine.

pub mod lut;
pub mod params;
pub mod scan;

pub use params::{
    Compression, DropoutColor, Format, ImageParams, ParamsTriple, ScanSettings, Source,
};
pub use scan::{PanelStatus, ReadOutcome, SensorStatus, Session, SessionPhase};
