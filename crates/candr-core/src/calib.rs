//! Analog front end and per-pixel calibration.
//!
//! Coarse calibration drives the AFE's offset, exposure and gain
//! registers from three short lamp-off/lamp-on scans. Fine
//! calibration builds full-width per-byte correction curves, either
//! computed from scans or read out of the device's internal buffer.
//! Both are keyed by (resolution, mode) and skipped while the key is
//! unchanged; the session invalidates the key when settings change.
//!
//! The scan loops live in the session; this module holds the state,
//! the derivation arithmetic and the register payload layout.

use tracing::debug;

use crate::image::{Mode, Side};
use crate::protocol::bytes::put_n;
use crate::protocol::cdb::{CC3_PAY_LEN, CC_PAY_LEN};

/// Exposure value used for the deliberately over-driven second pass.
pub const EXPOSURE_OVERDRIVE: u16 = 0x320;
/// Lines ingested per calibration scan.
pub const CAL_LINES: u32 = 8;

/// Peak targets, tuned per family: exposure scales the observed peak
/// toward these ceilings.
const EXP_TARGET_COLOR: u32 = 102;
const EXP_TARGET_MONO: u32 = 64;
const GAIN_TARGET_COLOR: i32 = 250;
const GAIN_TARGET_MONO: i32 = 125;

/// Calibration results for one device, front and back.
#[derive(Debug, Clone, Default)]
pub struct CalibrationState {
    /// Coarse AFE values per side. Offsets keep their full computed
    /// width here; the register write truncates like the firmware.
    pub c_gain: [i32; 2],
    pub c_offset: [i32; 2],
    pub c_exposure: [[u16; 3]; 2],
    /// Fine per-byte curves per side, sized to the scan line.
    pub f_offset: [Option<Vec<u8>>; 2],
    pub f_gain: [Option<Vec<u8>>; 2],
    /// (dpi, mode) the coarse pass was last run for.
    coarse_key: Option<(u32, Mode)>,
    /// (dpi, mode) the fine pass was last run for.
    fine_key: Option<(u32, Mode)>,
}

impl CalibrationState {
    pub fn coarse_is_current(&self, dpi: u32, mode: Mode) -> bool {
        self.coarse_key == Some((dpi, mode))
    }

    pub fn fine_is_current(&self, dpi: u32, mode: Mode) -> bool {
        self.fine_key == Some((dpi, mode))
    }

    pub fn record_coarse(&mut self, dpi: u32, mode: Mode) {
        self.coarse_key = Some((dpi, mode));
    }

    pub fn record_fine(&mut self, dpi: u32, mode: Mode) {
        self.fine_key = Some((dpi, mode));
    }

    /// Neutral AFE values for the lamp-off offset pass.
    pub fn reset_coarse(&mut self) {
        for side in 0..2 {
            self.c_gain[side] = 1;
            self.c_offset[side] = 1;
            self.c_exposure[side] = [0; 3];
        }
    }

    /// Drop the fine curves so reconstruction stops applying them
    /// while calibration scans run.
    pub fn clear_fine(&mut self) {
        self.f_offset = [None, None];
        self.f_gain = [None, None];
    }

    pub fn fine_offset(&self, side: Side) -> Option<&[u8]> {
        self.f_offset[side.index()].as_deref()
    }

    pub fn fine_gain(&self, side: Side) -> Option<&[u8]> {
        self.f_gain[side.index()].as_deref()
    }
}

/// Offset derivation from the lamp-off scan: triple the darkest
/// sample, less the register bias.
pub fn derive_offset(min_sample: u8) -> i32 {
    min_sample as i32 * 3 - 2
}

/// Scale the over-driven exposure so the observed peak lands on the
/// mode's target ceiling.
pub fn derive_exposure(exposure: u16, peak: u8, mode: Mode) -> u16 {
    let target = if mode == Mode::Color { EXP_TARGET_COLOR } else { EXP_TARGET_MONO };
    (exposure as u32 * target / peak.max(1) as u32) as u16
}

/// Gain from the lamp-on peak against the mode's ceiling, floored at
/// the register minimum.
pub fn derive_gain(peak: u8, mode: Mode) -> i32 {
    let target = if mode == Mode::Color { GAIN_TARGET_COLOR } else { GAIN_TARGET_MONO };
    ((target - peak as i32) * 4 / 5).max(1)
}

/// Darkest sample over the valid bytes of a side buffer.
pub fn min_sample(buffer: &[u8], valid_bpl: usize) -> u8 {
    buffer.iter().take(valid_bpl).copied().min().unwrap_or(255)
}

/// Brightest sample over the valid bytes of a side buffer.
pub fn max_sample(buffer: &[u8], valid_bpl: usize) -> u8 {
    buffer.iter().take(valid_bpl).copied().max().unwrap_or(0)
}

/// Brightest sample of one color channel (bytes stepping by 3).
pub fn max_channel_sample(buffer: &[u8], valid_bpl: usize, channel: usize) -> u8 {
    buffer
        .iter()
        .take(valid_bpl)
        .skip(channel)
        .step_by(3)
        .copied()
        .max()
        .unwrap_or(0)
}

/// Average `lines` scanlines into one per-byte curve.
pub fn average_curve(buffer: &[u8], bpl: usize, valid_bpl: usize, lines: u32) -> Vec<u8> {
    let mut curve = vec![0u8; bpl];
    for (j, entry) in curve.iter_mut().enumerate().take(valid_bpl) {
        let mut sum = 0u32;
        let mut k = j;
        for _ in 0..lines {
            sum += buffer[k] as u32;
            k += bpl;
        }
        *entry = (sum / lines) as u8;
    }
    curve
}

/// Floor every valid byte of a gain curve at 1.
pub fn floor_curve(curve: &mut [u8], valid_bpl: usize) {
    for b in curve.iter_mut().take(valid_bpl) {
        if *b < 1 {
            *b = 1;
        }
    }
}

/// Expand a duplex-interleaved device offset readout (front/back
/// alternating bytes) into one side's curve, copied across the three
/// channels in color mode, floored at 1.
pub fn expand_device_offset(raw: &[u8], side: Side, valid_width: usize, color: bool) -> Vec<u8> {
    let depth = if color { 3 } else { 1 };
    let mut curve = vec![0u8; valid_width * depth];
    for j in 0..valid_width {
        let v = raw[j * 2 + side.index()].max(1);
        for k in 0..depth {
            curve[j * depth + k] = v;
        }
    }
    curve
}

/// Merge one channel of a duplex-interleaved device gain readout into
/// a color curve, scaled by 3/4 and floored at 1.
pub fn merge_device_gain(
    curve: &mut [u8],
    raw: &[u8],
    side: Side,
    valid_width: usize,
    channel: usize,
) {
    for j in 0..valid_width {
        let v = (raw[j * 2 + side.index()] as u32 * 3 / 4).max(1) as u8;
        curve[j * 3 + channel] = v;
    }
}

/// Gray variant: one channel, straight copy with scale and floor.
pub fn expand_device_gain_gray(raw: &[u8], side: Side, valid_width: usize) -> Vec<u8> {
    let mut curve = vec![0u8; valid_width];
    for (j, entry) in curve.iter_mut().enumerate() {
        *entry = (raw[j * 2 + side.index()] as u32 * 3 / 4).max(1) as u8;
    }
    curve
}

/// Serialize the AFE register payload. Version 3 carries per-channel
/// gain/offset; the original layout shares one value per side and
/// doubles the exposure fields.
pub fn afe_payload(version: u8, cal: &CalibrationState) -> Vec<u8> {
    let f = Side::Front.index();
    let b = Side::Back.index();

    if version == 3 {
        let mut pay = vec![0u8; CC3_PAY_LEN];

        for k in 0..3 {
            pay[k] = cal.c_gain[f] as u8;
            pay[4 + k] = cal.c_offset[f] as u8;
            put_n(&mut pay, 0x08 + 2 * k, 2, cal.c_exposure[f][k] as u32);

            pay[0x14 + k] = cal.c_gain[b] as u8;
            pay[0x18 + k] = cal.c_offset[b] as u8;
            put_n(&mut pay, 0x1c + 2 * k, 2, cal.c_exposure[b][k] as u32);
        }
        pay
    } else {
        let mut pay = vec![0u8; CC_PAY_LEN];

        pay[0] = cal.c_gain[f] as u8;
        pay[1] = 1;
        pay[2] = cal.c_offset[f] as u8;
        pay[3] = 1;
        for k in 0..3 {
            put_n(&mut pay, 0x04 + 2 * k, 2, cal.c_exposure[f][k] as u32);
            put_n(&mut pay, 0x0a + 2 * k, 2, cal.c_exposure[f][k] as u32);
        }

        pay[0x10] = cal.c_gain[b] as u8;
        pay[0x12] = cal.c_offset[b] as u8;
        for k in 0..3 {
            put_n(&mut pay, 0x14 + 2 * k, 2, cal.c_exposure[b][k] as u32);
            put_n(&mut pay, 0x1a + 2 * k, 2, cal.c_exposure[b][k] as u32);
        }
        pay
    }
}

/// Log the coarse state after a pass, matching register truncation.
pub fn trace_coarse(cal: &CalibrationState, pass: &str) {
    for side in Side::BOTH {
        let i = side.index();
        debug!(
            pass,
            side = i,
            gain = cal.c_gain[i] as u8,
            offset = cal.c_offset[i] as u8,
            exposure = ?cal.c_exposure[i],
            "coarse calibration"
        );
    }
}
