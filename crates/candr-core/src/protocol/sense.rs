//! REQUEST SENSE block parsing and status translation.
//!
//! The device reports every non-good outcome through a fixed-format
//! 14-byte sense block. Translation is a static table keyed on
//! (sense key, ASC, ASCQ); combinations outside the table degrade to
//! an i/o error rather than killing the session.

use tracing::{debug, warn};

use super::bytes::{get_bits, get_n};
use crate::error::ScanError;

/// Parsed fields of a sense block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseBlock {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// End-of-medium flag.
    pub eom: bool,
    /// Incorrect-length indicator; `information` holds the residual.
    pub ili: bool,
    /// Residual byte count for short transfers.
    pub information: u32,
}

impl SenseBlock {
    /// Minimum block length needed to reach the ASCQ field.
    pub const LEN: usize = 0x0e;

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        Some(Self {
            sense_key: get_bits(data[0x02], 0x0f, 0),
            asc: data[0x0c],
            ascq: data[0x0d],
            eom: get_bits(data[0x02], 1, 6) != 0,
            ili: get_bits(data[0x02], 1, 5) != 0,
            information: get_n(data, 0x03, 4),
        })
    }
}

/// Outcome of translating a sense block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenseVerdict {
    /// Command completed, nothing to report.
    Good,
    /// Device delivered fewer bytes than requested; carries the
    /// residual count so the caller can compute the actual transfer.
    ShortRead(u32),
    /// Translated failure.
    Fail(ScanError),
}

/// Translate a parsed sense block into a driver verdict.
pub fn translate(sense: &SenseBlock) -> SenseVerdict {
    let SenseBlock { sense_key, asc, ascq, .. } = *sense;

    debug!(
        key = format!("{:#04x}", sense_key),
        asc = format!("{:#04x}", asc),
        ascq = format!("{:#04x}", ascq),
        eom = sense.eom,
        ili = sense.ili,
        info = sense.information,
        "sense block"
    );

    match (sense_key, asc, ascq) {
        // no sense: ILI means the transfer came up short
        (0x00, _, _) if sense.ili => SenseVerdict::ShortRead(sense.information),
        (0x00, _, _) => SenseVerdict::Good,

        // recovered error (parameter rounded etc): not fatal
        (0x01, _, _) => SenseVerdict::Good,

        // not ready
        (0x02, _, _) => SenseVerdict::Fail(ScanError::Busy),

        // medium errors
        (0x03, 0x36, 0x00) => SenseVerdict::Fail(ScanError::Io("no cartridge".into())),
        (0x03, 0x3a, 0x00) => SenseVerdict::Fail(ScanError::NoDocs),
        (0x03, 0x80, 0x00) => SenseVerdict::Fail(ScanError::Jammed),
        (0x03, 0x80, 0x01) => SenseVerdict::Fail(ScanError::CoverOpen),
        (0x03, 0x81, 0x01) => SenseVerdict::Fail(ScanError::Jammed), // double feed
        (0x03, 0x81, 0x02) => SenseVerdict::Fail(ScanError::Jammed), // skew
        (0x03, 0x81, 0x04) => SenseVerdict::Fail(ScanError::Jammed), // staple
        (0x03, _, _) => SenseVerdict::Fail(ScanError::Io("medium error".into())),

        // hardware errors
        (0x04, _, _) => SenseVerdict::Fail(ScanError::Io("hardware error".into())),

        // illegal request
        (0x05, 0x1a, 0x00) => SenseVerdict::Fail(ScanError::Invalid("parameter list".into())),
        (0x05, 0x20, 0x00) => SenseVerdict::Fail(ScanError::Invalid("invalid command".into())),
        (0x05, 0x24, 0x00) => SenseVerdict::Fail(ScanError::Invalid("invalid CDB field".into())),
        (0x05, 0x25, 0x00) => {
            SenseVerdict::Fail(ScanError::Unsupported("logical unit".into()))
        }
        (0x05, 0x26, 0x00) => {
            SenseVerdict::Fail(ScanError::Invalid("invalid field in parameter list".into()))
        }
        (0x05, 0x2c, 0x00) => SenseVerdict::Fail(ScanError::Invalid("command sequence".into())),
        (0x05, 0x2c, 0x01) => SenseVerdict::Fail(ScanError::Invalid("too many windows".into())),
        (0x05, 0x3a, 0x00) => SenseVerdict::Fail(ScanError::NoDocs),
        (0x05, 0x3d, 0x00) => SenseVerdict::Fail(ScanError::Invalid("invalid IDENTIFY".into())),
        (0x05, 0x55, 0x00) => SenseVerdict::Fail(ScanError::NoMem),
        (0x05, _, _) => SenseVerdict::Fail(ScanError::Io("illegal request".into())),

        // unit attention (reset, parameter change): harmless
        (0x06, _, _) => SenseVerdict::Good,

        // aborted command
        (0x0b, 0x00, 0x00) => SenseVerdict::Fail(ScanError::Cancelled),
        (0x0b, _, _) => SenseVerdict::Fail(ScanError::Io("aborted command".into())),

        (key, asc, ascq) => {
            warn!(
                key = format!("{:#04x}", key),
                asc = format!("{:#04x}", asc),
                ascq = format!("{:#04x}", ascq),
                "unmapped sense combination"
            );
            SenseVerdict::Fail(ScanError::Io("unknown sense".into()))
        }
    }
}

/// Parse and translate a raw sense block in one step.
pub fn decode(data: &[u8]) -> SenseVerdict {
    match SenseBlock::parse(data) {
        Some(sense) => translate(&sense),
        None => {
            warn!(len = data.len(), "sense block too short");
            SenseVerdict::Fail(ScanError::Io("truncated sense block".into()))
        }
    }
}
