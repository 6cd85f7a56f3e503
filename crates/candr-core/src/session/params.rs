//! Scan parameters and their three projections.
//!
//! The caller's request (`user`) is projected onto what the device can
//! actually do (`scanner`), and a third set (`delivered`) describes
//! what the caller will finally receive once padding is stripped and
//! geometry restored. All three carry per-side transfer counters with
//! the invariant `bytes_sent <= bytes_tot`, and a side is at eof
//! exactly when the two are equal.

use tracing::debug;

use crate::device::{DeviceModel, STD_DPI};
use crate::error::ScanError;
use crate::image::{ColorInterlace, Mode, Side};

/// Paper path and sides to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    Flatbed,
    #[default]
    AdfFront,
    AdfBack,
    AdfDuplex,
    CardFront,
    CardBack,
    CardDuplex,
}

impl Source {
    pub fn is_duplex(self) -> bool {
        matches!(self, Source::AdfDuplex | Source::CardDuplex)
    }

    /// Back-side-only sources never fill the front buffer.
    pub fn is_back_only(self) -> bool {
        matches!(self, Source::AdfBack | Source::CardBack)
    }

    pub fn is_card(self) -> bool {
        matches!(self, Source::CardFront | Source::CardBack | Source::CardDuplex)
    }

    pub fn fills(self, side: Side) -> bool {
        match side {
            Side::Front => !self.is_back_only(),
            Side::Back => self.is_duplex() || self.is_back_only(),
        }
    }
}

/// Data layout of the delivered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Gray,
    Rgb,
    Jpeg,
}

/// Compression choice requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Jpeg,
}

/// Dropout/enhance channel for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropoutColor {
    #[default]
    None,
    Red,
    Green,
    Blue,
    EnhanceRed,
    EnhanceGreen,
    EnhanceBlue,
}

/// The caller's scan request. Mutated only by explicit option sets.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub mode: Mode,
    pub source: Source,
    pub dpi_x: u32,
    pub dpi_y: u32,
    /// Crop rectangle, 1/1200 inch.
    pub tl_x: u32,
    pub tl_y: u32,
    pub br_x: u32,
    pub br_y: u32,
    /// Physical page size, 1/1200 inch.
    pub page_x: u32,
    pub page_y: u32,
    pub brightness: i32,
    pub contrast: i32,
    pub threshold: u8,
    pub compression: Compression,
    pub compress_arg: u8,
    pub df_length: bool,
    pub df_thickness: bool,
    pub roller_deskew: bool,
    pub staple_detect: bool,
    pub sw_deskew: bool,
    pub sw_crop: bool,
    /// Despeckle window diameter in pixels; 0 disables.
    pub sw_despeckle: u32,
    pub dropout_front: DropoutColor,
    pub dropout_back: DropoutColor,
    pub buffer_mode: bool,
}

impl ScanSettings {
    /// Sensible defaults for a freshly attached device.
    pub fn for_model(model: &DeviceModel) -> Self {
        let source = if model.has_flatbed {
            Source::Flatbed
        } else if model.has_adf {
            Source::AdfFront
        } else {
            Source::CardFront
        };

        let mode = if model.can_mono {
            Mode::Lineart
        } else if model.can_halftone {
            Mode::Halftone
        } else if model.can_gray {
            Mode::Gray
        } else {
            Mode::Color
        };

        // US Letter, shrunk to hardware limits
        let page_x = (8.5 * 1200.0) as u32;
        let page_x = page_x.min(model.valid_x.max(1));
        let page_y = 11 * 1200;
        let page_y = page_y.min(model.max_y.max(1));

        Self {
            mode,
            source,
            dpi_x: model.basic_x_res,
            dpi_y: model.basic_x_res,
            tl_x: 0,
            tl_y: 0,
            br_x: page_x,
            br_y: page_y,
            page_x,
            page_y,
            brightness: 0,
            contrast: 0,
            threshold: 90,
            compression: Compression::None,
            compress_arg: 50,
            df_length: false,
            df_thickness: false,
            roller_deskew: false,
            staple_detect: false,
            sw_deskew: false,
            sw_crop: false,
            sw_despeckle: 0,
            dropout_front: DropoutColor::None,
            dropout_back: DropoutColor::None,
            buffer_mode: false,
        }
    }

    /// Effective page width, honoring flatbed and overscan limits.
    pub fn effective_page_x(&self, model: &DeviceModel) -> u32 {
        if self.source == Source::Flatbed {
            return model.max_x_fb;
        }
        self.page_x.min(model.valid_x)
    }

    /// Effective page height.
    pub fn effective_page_y(&self, model: &DeviceModel) -> u32 {
        if self.source == Source::Flatbed {
            return model.max_y_fb;
        }
        self.page_y.min(model.max_y)
    }
}

/// One projection of the scan geometry plus transfer bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ImageParams {
    pub mode: Mode,
    pub format: Format,
    pub source: Source,
    /// Pixels per line / lines per side.
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// Bytes per line as transmitted.
    pub bpl: usize,
    /// Bytes/pixels per line carrying real image data.
    pub valid_bpl: usize,
    pub valid_width: u32,
    pub dpi_x: u32,
    pub dpi_y: u32,
    pub tl_x: u32,
    pub tl_y: u32,
    pub br_x: u32,
    pub br_y: u32,
    pub page_x: u32,
    pub page_y: u32,
    /// Leading padding lines to drop, per side.
    pub skip_lines: [usize; 2],
    pub bytes_sent: [usize; 2],
    pub bytes_tot: [usize; 2],
    pub eof: [bool; 2],
}

impl ImageParams {
    pub fn remaining(&self, side: Side) -> usize {
        self.bytes_tot[side.index()] - self.bytes_sent[side.index()]
    }

    /// Reset counters and recompute per-side totals from geometry.
    pub fn clean_counters(&mut self) {
        self.bytes_sent = [0; 2];
        self.eof = [false; 2];
        self.bytes_tot = [0; 2];

        let page_bytes = self.bpl * self.height as usize;
        if self.source.fills(Side::Front) {
            self.bytes_tot[Side::Front.index()] = page_bytes;
        }
        if self.source.fills(Side::Back) {
            self.bytes_tot[Side::Back.index()] = page_bytes;
        }
    }

    /// Mark a side complete, forcing the counters consistent.
    pub fn finish_side(&mut self, side: Side) {
        self.bytes_sent[side.index()] = self.bytes_tot[side.index()];
        self.eof[side.index()] = true;
    }
}

/// The three projections, recomputed together.
#[derive(Debug, Clone, Default)]
pub struct ParamsTriple {
    /// What the caller asked for.
    pub user: ImageParams,
    /// What the device will be programmed to do.
    pub scanner: ImageParams,
    /// What the caller will be handed.
    pub delivered: ImageParams,
}

impl ParamsTriple {
    /// Project the settings through device capabilities. `calib` scans
    /// keep the data exactly as the device sends it.
    pub fn compute(
        settings: &ScanSettings,
        model: &DeviceModel,
        calib: bool,
    ) -> Result<Self, ScanError> {
        let user = user_params(settings, model);
        let scanner = scanner_params(&user, model, calib)?;

        // calibration wants raw device geometry; normal scans are
        // presented in the caller's geometry with padding dropped
        let mut delivered = if calib { scanner.clone() } else { user.clone() };
        if !calib && delivered.source.is_duplex() && model.duplex_offset != 0 {
            delivered.skip_lines[model.duplex_offset_side.index()] =
                (model.duplex_offset * delivered.dpi_y / 1200) as usize;
        }

        debug!(
            uw = user.width,
            uh = user.height,
            sw = scanner.width,
            sh = scanner.height,
            s_bpl = scanner.bpl,
            s_valid_bpl = scanner.valid_bpl,
            "computed params"
        );

        Ok(Self { user, scanner, delivered })
    }

    /// Reset all counters for a fresh page.
    pub fn clean(&mut self) {
        self.user.clean_counters();
        self.scanner.clean_counters();
        self.delivered.clean_counters();
    }

    /// Undo geometry rewrites done by the page post-processors.
    pub fn reset_delivered_geometry(&mut self) {
        self.delivered.width = self.user.width;
        self.delivered.bpl = self.user.bpl;
        self.delivered.height = self.user.height;
    }
}

fn user_params(settings: &ScanSettings, model: &DeviceModel) -> ImageParams {
    let mut p = ImageParams {
        mode: settings.mode,
        source: settings.source,
        dpi_x: settings.dpi_x,
        dpi_y: settings.dpi_y,
        tl_x: settings.tl_x,
        tl_y: settings.tl_y,
        br_x: settings.br_x,
        br_y: settings.br_y,
        page_x: settings.effective_page_x(model),
        page_y: settings.effective_page_y(model),
        ..Default::default()
    };

    p.width = (p.br_x - p.tl_x) * p.dpi_x / 1200;
    p.height = (p.br_y - p.tl_y) * p.dpi_y / 1200;

    match p.mode {
        Mode::Color => {
            p.format = Format::Rgb;
            p.bpp = 24;
        }
        Mode::Gray => {
            p.format = Format::Gray;
            p.bpp = 8;
        }
        Mode::Lineart | Mode::Halftone => {
            p.format = Format::Gray;
            p.bpp = 1;
            p.width -= p.width % 8;
        }
    }

    p.width -= p.width % model.ppl_mod;

    // jpeg wants 8x8 blocks
    if settings.compression == Compression::Jpeg && p.mode >= Mode::Gray {
        p.format = Format::Jpeg;
        p.width -= p.width % 8;
        p.height -= p.height % 8;
    }

    p.bpl = (p.width * p.bpp / 8) as usize;
    p.valid_bpl = p.bpl;
    p.valid_width = p.width;
    p
}

fn scanner_params(
    user: &ImageParams,
    model: &DeviceModel,
    calib: bool,
) -> Result<ImageParams, ScanError> {
    let mut p = user.clone();

    // move unavailable modes up to the nearest deeper one
    if p.mode == Mode::Lineart && !model.can_mono {
        p.mode = Mode::Gray;
        p.format = Format::Gray;
        p.bpp = 8;
    }
    if p.mode == Mode::Gray && !model.can_gray {
        p.mode = Mode::Color;
        p.format = Format::Rgb;
        p.bpp = 24;
    }
    if p.mode == Mode::Color && !model.can_color {
        return Err(ScanError::Invalid("no valid scan mode".into()));
    }

    // list-bound devices: move the resolution up to a listed one
    if !model.step_x_res {
        for (i, &dpi) in STD_DPI.iter().enumerate() {
            if p.dpi_x > dpi || !model.std_res_x[i] {
                continue;
            }
            if p.dpi_x != dpi {
                debug!(from = p.dpi_x, to = dpi, "resolution moved to listed value");
                p.dpi_x = dpi;
            }
            break;
        }
    }

    // fixed-width devices scan the whole sensor no matter what
    if model.fixed_width {
        p.tl_x = 0;
        p.br_x = model.max_x;
        p.page_x = model.max_x;
    }

    p.width = (p.br_x - p.tl_x) * p.dpi_x / 1200;
    if p.mode.is_binary() {
        p.width -= p.width % 8;
    }
    p.width -= p.width % model.ppl_mod;

    p.valid_width = p.width;
    p.valid_bpl = (p.valid_width * p.bpp / 8) as usize;

    // some machines require an even byte count per line; pad width
    // but leave the valid sizes alone
    if model.even_bpl && p.width % 2 == 1 {
        p.width += 1;
    }

    p.bpl = (p.width * p.bpp / 8) as usize;

    // three-head models pad every line by 1/12
    if model.color_interlace[Side::Front.index()] == ColorInterlace::ThreeHead {
        p.valid_bpl = p.bpl * 11 / 12;
        p.valid_width = p.width * 11 / 12;
    }

    // offset sensors need longer duplex scans
    if user.source.is_duplex() && model.duplex_offset != 0 && !calib {
        p.height = (user.br_y - user.tl_y + model.duplex_offset) * user.dpi_y / 1200;
    }

    // round lines up to an even number
    p.height += p.height % 2;

    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Connection, dpi_index};

    fn model() -> DeviceModel {
        let mut m = DeviceModel::new(
            "CANON".into(),
            "DR-TEST".into(),
            "1.00".into(),
            Connection::Usb,
        );
        m.max_x = 10200;
        m.max_y = 17 * 1200;
        m.valid_x = 10200;
        m.max_x_fb = 10200;
        m.max_y_fb = 14 * 1200;
        m.basic_x_res = 300;
        m.basic_y_res = 300;
        m.can_gray = true;
        m.can_mono = true;
        m.can_color = true;
        m.std_res_x[dpi_index(200)] = true;
        m.std_res_x[dpi_index(300)] = true;
        m.std_res_x[dpi_index(600)] = true;
        m.std_res_y = m.std_res_x;
        m
    }

    fn settings(m: &DeviceModel) -> ScanSettings {
        let mut s = ScanSettings::for_model(m);
        s.mode = Mode::Gray;
        s.dpi_x = 300;
        s.dpi_y = 300;
        s.tl_x = 0;
        s.tl_y = 0;
        s.br_x = 4 * 1200;
        s.br_y = 6 * 1200;
        s
    }

    #[test]
    fn test_basic_geometry() {
        let m = model();
        let t = ParamsTriple::compute(&settings(&m), &m, false).unwrap();
        assert_eq!(t.user.width, 1200);
        assert_eq!(t.user.height, 1800);
        assert_eq!(t.user.bpl, 1200);
        assert_eq!(t.scanner.width, 1200);
        assert_eq!(t.delivered.width, 1200);
    }

    #[test]
    fn test_counters_invariant() {
        let m = model();
        let mut t = ParamsTriple::compute(&settings(&m), &m, false).unwrap();
        t.clean();
        let tot = t.user.bytes_tot[0];
        assert_eq!(tot, 1200 * 1800);
        assert_eq!(t.user.bytes_tot[1], 0); // simplex front
        assert_eq!(t.user.remaining(Side::Front), tot);
        assert!(!t.user.eof[0]);

        t.user.finish_side(Side::Front);
        assert_eq!(t.user.bytes_sent[0], tot);
        assert!(t.user.eof[0]);
    }

    #[test]
    fn test_duplex_fills_both_sides() {
        let m = model();
        let mut s = settings(&m);
        s.source = Source::AdfDuplex;
        let mut t = ParamsTriple::compute(&s, &m, false).unwrap();
        t.clean();
        assert!(t.user.bytes_tot[0] > 0);
        assert_eq!(t.user.bytes_tot[0], t.user.bytes_tot[1]);

        let mut s2 = settings(&m);
        s2.source = Source::AdfBack;
        let mut t2 = ParamsTriple::compute(&s2, &m, false).unwrap();
        t2.clean();
        assert_eq!(t2.user.bytes_tot[0], 0);
        assert!(t2.user.bytes_tot[1] > 0);
    }

    #[test]
    fn test_mode_fallback() {
        let mut m = model();
        m.can_mono = false;
        let mut s = settings(&m);
        s.mode = Mode::Lineart;
        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        assert_eq!(t.user.mode, Mode::Lineart);
        assert_eq!(t.scanner.mode, Mode::Gray);
        assert_eq!(t.scanner.bpp, 8);
    }

    #[test]
    fn test_no_mode_at_all() {
        let mut m = model();
        m.can_mono = false;
        m.can_gray = false;
        m.can_color = false;
        let mut s = settings(&m);
        s.mode = Mode::Gray;
        assert!(matches!(
            ParamsTriple::compute(&s, &m, false),
            Err(ScanError::Invalid(_))
        ));
    }

    #[test]
    fn test_resolution_moves_up_to_listed() {
        let m = model();
        let mut s = settings(&m);
        s.dpi_x = 250;
        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        assert_eq!(t.user.dpi_x, 250);
        assert_eq!(t.scanner.dpi_x, 300);
    }

    #[test]
    fn test_lineart_rounds_to_byte_boundary() {
        let m = model();
        let mut s = settings(&m);
        s.mode = Mode::Lineart;
        s.br_x = 4 * 1200 + 20; // 1205 pixels at 300 dpi
        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        assert_eq!(t.user.width % 8, 0);
        assert_eq!(t.user.bpp, 1);
    }

    #[test]
    fn test_fixed_width_overrides_window() {
        let mut m = model();
        m.fixed_width = true;
        let t = ParamsTriple::compute(&settings(&m), &m, false).unwrap();
        assert_eq!(t.scanner.tl_x, 0);
        assert_eq!(t.scanner.br_x, m.max_x);
        assert_eq!(t.scanner.width, m.max_x * 300 / 1200);
        // user view unchanged
        assert_eq!(t.user.width, 1200);
    }

    #[test]
    fn test_three_head_padding_ratio() {
        let mut m = model();
        m.color_interlace = [ColorInterlace::ThreeHead; 2];
        let mut s = settings(&m);
        s.mode = Mode::Color;
        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        assert_eq!(t.scanner.valid_bpl, t.scanner.bpl * 11 / 12);
        assert_eq!(t.scanner.valid_width, t.scanner.width * 11 / 12);
    }

    #[test]
    fn test_duplex_offset_lengthens_scan_and_skips_lines() {
        let mut m = model();
        m.duplex_offset = 400;
        m.duplex_offset_side = Side::Back;
        let mut s = settings(&m);
        s.source = Source::AdfDuplex;

        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        let expect_h = (6 * 1200 + 400) * 300 / 1200;
        assert_eq!(t.scanner.height, expect_h + expect_h % 2);
        assert_eq!(t.delivered.skip_lines[Side::Back.index()], 400 * 300 / 1200);
        assert_eq!(t.delivered.skip_lines[Side::Front.index()], 0);

        // calibration scans are not lengthened
        let t = ParamsTriple::compute(&s, &m, true).unwrap();
        assert_eq!(t.scanner.height, 1800);
        assert_eq!(t.delivered.skip_lines, [0, 0]);
    }

    #[test]
    fn test_jpeg_blocks() {
        let m = model();
        let mut s = settings(&m);
        s.mode = Mode::Color;
        s.compression = Compression::Jpeg;
        s.br_x = 1204 * 1200 / 300; // width 1204
        s.br_y = 1801 * 1200 / 300;
        let t = ParamsTriple::compute(&s, &m, false).unwrap();
        assert_eq!(t.user.format, Format::Jpeg);
        assert_eq!(t.user.width % 8, 0);
        assert_eq!(t.user.height % 8, 0);
    }
}
