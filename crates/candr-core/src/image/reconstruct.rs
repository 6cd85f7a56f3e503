//! Per-scanline correction and geometry reconciliation.
//!
//! After de-interlacing, each line may need photometric inversion,
//! fine calibration curves, and a software tone curve. When the
//! device could not scan at the requested geometry (fixed-width
//! sensors, missing resolutions) a second stage rebuilds the line the
//! caller actually asked for.

use super::Mode;

/// Gain curves are scaled against this numerator.
pub const GAIN_SCALE: u32 = 240;

/// Corrections applied in place to one de-interlaced line.
#[derive(Default)]
pub struct LineCorrections<'a> {
    /// Photometric inversion (lineart/halftone on most models).
    pub invert: bool,
    /// Fine per-byte offset curve, subtracted and clamped at 0.
    pub fine_offset: Option<&'a [u8]>,
    /// Fine per-byte gain curve, applied as 240/gain, clamped at 255.
    pub fine_gain: Option<&'a [u8]>,
    /// Software brightness/contrast table.
    pub lut: Option<&'a [u8; 256]>,
    /// Bytes of the line carrying image data (the rest is padding).
    pub valid_bpl: usize,
}

pub fn apply_corrections(line: &mut [u8], c: &LineCorrections<'_>) {
    if c.invert {
        for b in line.iter_mut() {
            *b ^= 0xff;
        }
    }

    if let Some(offset) = c.fine_offset {
        for j in 0..c.valid_bpl.min(line.len()) {
            line[j] = line[j].saturating_sub(offset[j]);
        }
    }

    if let Some(gain) = c.fine_gain {
        for j in 0..c.valid_bpl.min(line.len()) {
            let curr = line[j] as u32 * GAIN_SCALE / gain[j].max(1) as u32;
            line[j] = curr.min(255) as u8;
        }
    }

    if let Some(lut) = c.lut {
        for j in 0..c.valid_bpl.min(line.len()) {
            line[j] = lut[line[j] as usize];
        }
    }
}

/// Geometry of the dumb-scanner reconciliation path.
#[derive(Debug, Clone, Copy)]
pub struct DumbScanSpec {
    /// Line as the device scanned it.
    pub scan_width: usize,
    pub scan_dpi_x: u32,
    pub scan_mode: Mode,
    /// Line as the caller requested it.
    pub out_width: usize,
    pub out_bpl: usize,
    pub out_dpi_x: u32,
    pub out_mode: Mode,
    /// Left crop, output pixels.
    pub offset_pixels: usize,
    /// Binarization threshold for lineart output.
    pub threshold: u8,
}

impl DumbScanSpec {
    /// The smart path applies when device and request agree.
    pub fn is_noop(&self) -> bool {
        self.scan_width == self.out_width
            && self.scan_dpi_x == self.out_dpi_x
            && self.scan_mode == self.out_mode
    }
}

/// Rebuild one line in the caller's geometry: expand to 24-bit,
/// resample in x, crop from the left, and re-derive the target mode.
pub fn reconcile_line(buff: &[u8], spec: &DumbScanSpec) -> Vec<u8> {
    let spwidth = spec.scan_width;

    // expand whatever we have to a 24-bit line
    let mut line = vec![0u8; spwidth * 3];
    match spec.scan_mode {
        Mode::Color => {
            line[..buff.len().min(spwidth * 3)]
                .copy_from_slice(&buff[..buff.len().min(spwidth * 3)]);
        }
        Mode::Gray => {
            for i in 0..spwidth.min(buff.len()) {
                line[i * 3] = buff[i];
                line[i * 3 + 1] = buff[i];
                line[i * 3 + 2] = buff[i];
            }
        }
        Mode::Lineart | Mode::Halftone => {
            for (i, &byte) in buff.iter().enumerate() {
                for bit in 0..8 {
                    let v = if (byte >> (7 - bit)) & 1 != 0 { 0 } else { 255 };
                    let px = i * 24 + bit * 3;
                    if px + 2 < line.len() {
                        line[px] = v;
                        line[px + 1] = v;
                        line[px + 2] = v;
                    }
                }
            }
        }
    }

    // nearest-neighbor resample when the device scanned at a higher
    // resolution than requested
    if spec.out_dpi_x != spec.scan_dpi_x {
        for i in 0..spwidth {
            let source = (i as u32 * spec.scan_dpi_x / spec.out_dpi_x) as usize * 3;
            if source + 2 >= spwidth * 3 {
                break;
            }
            line[i * 3] = line[source];
            line[i * 3 + 1] = line[source + 1];
            line[i * 3 + 2] = line[source + 2];
        }
    }

    let offset = spec.offset_pixels;

    // re-derive the caller's mode
    let mut out = vec![0u8; spec.out_bpl];
    match spec.out_mode {
        Mode::Color => {
            let start = (offset * 3).min(line.len());
            let end = (start + spec.out_bpl).min(line.len());
            out[..end - start].copy_from_slice(&line[start..end]);
        }
        Mode::Gray => {
            for i in 0..spec.out_bpl {
                let source = (offset + i) * 3;
                if source + 2 >= line.len() {
                    break;
                }
                out[i] = ((line[source] as u32 + line[source + 1] as u32
                    + line[source + 2] as u32)
                    / 3) as u8;
            }
        }
        Mode::Lineart | Mode::Halftone => {
            let thresh = spec.threshold as u32 * 3;
            for i in 0..spec.out_bpl {
                let mut curr = 0u8;
                for bit in 0..8 {
                    let source = offset * 3 + i * 24 + bit * 3;
                    if source + 2 >= line.len() {
                        break;
                    }
                    let sum = line[source] as u32
                        + line[source + 1] as u32
                        + line[source + 2] as u32;
                    if sum < thresh {
                        curr |= 1 << (7 - bit);
                    }
                }
                out[i] = curr;
            }
        }
    }

    out
}

/// Compressed streams arrive with zero height/width in the SOF
/// marker; this stateful patcher fixes them as the bytes go by.
#[derive(Debug, Default)]
pub struct JpegSofPatcher {
    in_sof: bool,
    done: bool,
    ff_offset: i64,
}

impl JpegSofPatcher {
    pub fn new() -> Self {
        Self { in_sof: false, done: false, ff_offset: -1 }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Scan a block near the start of the stream, overwriting the SOF
    /// dimensions with the known scan geometry.
    pub fn patch(&mut self, data: &mut [u8], height: u32, width: u32) {
        if self.done {
            return;
        }
        for i in 0..data.len() {
            if !self.in_sof && data[i] == 0xff {
                self.ff_offset = 0;
                continue;
            }
            self.ff_offset += 1;

            if self.ff_offset == 1 && data[i] == 0xc0 {
                self.in_sof = true;
                continue;
            }

            if self.in_sof {
                match self.ff_offset {
                    5 => data[i] = (height >> 8) as u8,
                    6 => data[i] = height as u8,
                    7 => data[i] = (width >> 8) as u8,
                    8 => {
                        data[i] = width as u8;
                        self.done = true;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
