//! Device capability and quirk records.

pub mod inquiry;
pub mod quirks;
pub mod registry;

use crate::image::{ColorInterlace, DuplexInterlace, GrayInterlace, Mode, Side};

/// How the device is wired to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connection {
    Scsi,
    #[default]
    Usb,
}

/// Standard resolution steps the capability page can report.
pub const STD_DPI: [u32; 16] = [
    60, 75, 100, 120, 150, 160, 180, 200, 240, 300, 320, 400, 480, 600, 800, 1200,
];

/// Index into [`STD_DPI`], or the list length when not listed.
pub fn dpi_index(dpi: u32) -> usize {
    STD_DPI.iter().position(|&d| d == dpi).unwrap_or(STD_DPI.len())
}

/// Which command set programs scan modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanModeCmd {
    /// SET SCAN MODE (0xd6), page-format payloads.
    #[default]
    Ssm,
    /// SET SCAN MODE 2 (0xe5), newer models.
    Ssm2,
    /// Neither supported.
    None,
}

/// Capability and quirk record for one attached device.
///
/// Built once at attach time from INQUIRY, VPD, the model quirk table
/// and config overrides; immutable afterwards.
#[derive(Debug, Clone)]
pub struct DeviceModel {
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub connection: Connection,

    /// Negotiated image read block size, bytes.
    pub buffer_size: usize,

    // --- capability data from VPD -------------------------------------
    pub basic_x_res: u32,
    pub basic_y_res: u32,
    /// Continuous resolution steps supported (else list-bound).
    pub step_x_res: bool,
    pub step_y_res: bool,
    pub max_x_res: u32,
    pub max_y_res: u32,
    pub min_x_res: u32,
    pub min_y_res: u32,
    /// Per-entry flags for [`STD_DPI`].
    pub std_res_x: [bool; 16],
    pub std_res_y: [bool; 16],
    /// ADF extents, 1/1200 inch.
    pub max_x: u32,
    pub max_y: u32,
    /// Flatbed extents, 1/1200 inch.
    pub max_x_fb: u32,
    pub max_y_fb: u32,
    /// Usable sensor width, 1/1200 inch.
    pub valid_x: u32,

    pub can_gray: bool,
    pub can_halftone: bool,
    pub can_mono: bool,
    pub can_color: bool,
    pub can_overflow: bool,

    // --- feature flags ------------------------------------------------
    pub has_adf: bool,
    pub has_flatbed: bool,
    pub has_duplex: bool,
    pub has_card: bool,
    pub has_buffer: bool,
    pub has_df: bool,
    pub has_df_ultra: bool,
    /// Window carries brightness/threshold/contrast.
    pub has_btc: bool,
    pub has_counter: bool,
    pub can_read_panel: bool,
    pub can_write_panel: bool,
    pub can_read_sensors: bool,
    pub has_comp_jpeg: bool,
    /// Device wants OBJECT POSITION before every page.
    pub always_op: bool,
    pub scan_mode_cmd: ScanModeCmd,
    /// SET SCAN MODE payload carries an explicit head length.
    pub ssm_pay_head_len: bool,

    // --- quirks -------------------------------------------------------
    /// Modes delivered photometrically inverted.
    pub reverse_by_mode: [bool; 4],
    pub color_interlace: [ColorInterlace; 2],
    pub gray_interlace: [GrayInterlace; 2],
    /// Per-resolution color interlace override, indexed like STD_DPI.
    pub color_inter_by_res: [Option<ColorInterlace>; 16],
    pub duplex_interlace: DuplexInterlace,
    /// Device always scans its full sensor width.
    pub fixed_width: bool,
    /// Scanline byte counts must be even.
    pub even_bpl: bool,
    /// Width is rounded down to a multiple of this many pixels.
    pub ppl_mod: u32,
    /// ULY field must be sent bit-inverted.
    pub invert_tly: bool,
    /// RGB byte-order code for the window descriptor.
    pub rgb_format: u8,
    /// Vendor-specific window byte, meaning unknown.
    pub window_vendor_byte: u8,
    /// Paper background seen by the sensor.
    pub bg_color: u8,
    pub need_ccal: bool,
    /// Coarse calibration payload version (0 or 3).
    pub ccal_version: u8,
    pub need_fcal: bool,
    /// Fine calibration read from the device's internal buffer.
    pub need_fcal_buffer: bool,
    /// Brightness/contrast applied in software, not device LUT.
    pub sw_lut: bool,
    /// Front/back sensor offset, 1/1200 inch (config supplied).
    pub duplex_offset: u32,
    /// Which side the offset pads.
    pub duplex_offset_side: Side,

    pub brightness_steps: u32,
    pub contrast_steps: u32,
    pub threshold_steps: u32,
}

impl DeviceModel {
    /// Family-wide defaults, applied before VPD and the quirk table.
    pub fn new(vendor: String, model: String, version: String, connection: Connection) -> Self {
        Self {
            vendor,
            model,
            version,
            connection,
            buffer_size: crate::config::DEFAULT_BUFFER_SIZE,
            basic_x_res: 0,
            basic_y_res: 0,
            step_x_res: false,
            step_y_res: false,
            max_x_res: 0,
            max_y_res: 0,
            min_x_res: 0,
            min_y_res: 0,
            std_res_x: [false; 16],
            std_res_y: [false; 16],
            max_x: 0,
            max_y: 0,
            max_x_fb: 0,
            max_y_fb: 0,
            valid_x: 0,
            can_gray: false,
            can_halftone: false,
            can_mono: false,
            can_color: false,
            can_overflow: false,
            has_adf: true,
            has_flatbed: false,
            has_duplex: true,
            has_card: false,
            has_buffer: true,
            has_df: true,
            has_df_ultra: false,
            has_btc: true,
            has_counter: true,
            can_read_panel: true,
            can_write_panel: true,
            can_read_sensors: false,
            has_comp_jpeg: false,
            always_op: true,
            scan_mode_cmd: ScanModeCmd::Ssm,
            ssm_pay_head_len: false,
            reverse_by_mode: [true, true, false, false],
            color_interlace: [ColorInterlace::Rgb; 2],
            gray_interlace: [GrayInterlace::None; 2],
            color_inter_by_res: [None; 16],
            duplex_interlace: DuplexInterlace::None,
            fixed_width: false,
            even_bpl: false,
            ppl_mod: 1,
            invert_tly: false,
            rgb_format: 0,
            window_vendor_byte: 0,
            bg_color: 0xee,
            need_ccal: false,
            ccal_version: 0,
            need_fcal: false,
            need_fcal_buffer: false,
            sw_lut: false,
            duplex_offset: 0,
            duplex_offset_side: Side::Back,
            brightness_steps: 255,
            contrast_steps: 255,
            threshold_steps: 255,
        }
    }

    /// Color interlace for a side, honoring per-resolution overrides.
    pub fn color_interlace_at(&self, side: Side, dpi: u32) -> ColorInterlace {
        let idx = dpi_index(dpi);
        if idx < self.color_inter_by_res.len() {
            if let Some(inter) = self.color_inter_by_res[idx] {
                return inter;
            }
        }
        self.color_interlace[side.index()]
    }

    /// Whether a mode is available on this device.
    pub fn supports_mode(&self, mode: Mode) -> bool {
        match mode {
            Mode::Lineart => self.can_mono,
            Mode::Halftone => self.can_halftone,
            Mode::Gray => self.can_gray,
            Mode::Color => self.can_color,
        }
    }
}
