//! Model quirk table.
//!
//! Capability pages lie by omission: interlacing schemes, calibration
//! requirements and geometry limits are not reported by the device at
//! all. This table patches them in, keyed by model-name substring.
//! Entries are consulted in order and the first match wins; the table
//! runs once at attach time.

use tracing::debug;

use super::{DeviceModel, ScanModeCmd, dpi_index};
use crate::image::{ColorInterlace, DuplexInterlace, GrayInterlace, Mode, Side};

struct Quirk {
    patterns: &'static [&'static str],
    apply: fn(&mut DeviceModel),
}

fn set_std_res(m: &mut DeviceModel, dpis: &[u32], avail: bool) {
    for &dpi in dpis {
        m.std_res_x[dpi_index(dpi)] = avail;
    }
}

fn set_std_res_xy(m: &mut DeviceModel, dpis: &[u32]) {
    for &dpi in dpis {
        m.std_res_x[dpi_index(dpi)] = true;
        m.std_res_y[dpi_index(dpi)] = true;
    }
}

/// Sensor width of the small fixed-width models: 8.5 inches.
const FIXED_VALID_X: u32 = (8.5 * 1200.0) as u32;

static MODEL_QUIRKS: &[Quirk] = &[
    Quirk {
        patterns: &["DR-9080", "DR-7580"],
        apply: |m| {
            m.has_comp_jpeg = true;
            m.rgb_format = 2;
        },
    },
    Quirk {
        patterns: &["DR-7090"],
        apply: |m| {
            m.has_flatbed = true;
        },
    },
    Quirk {
        patterns: &["DR-9050", "DR-7550", "DR-6050", "DR-G1100", "DR-G1130"],
        apply: |m| {
            // vpd is missing the real resolution list
            set_std_res_xy(m, &[100, 150, 200, 240, 300, 400, 600]);
            m.scan_mode_cmd = ScanModeCmd::Ssm2;
        },
    },
    Quirk {
        patterns: &["DR-4080", "DR-4580", "DR-7080"],
        apply: |m| {
            m.has_flatbed = true;
        },
    },
    Quirk {
        patterns: &["DR-2580"],
        apply: |m| {
            m.invert_tly = true;
            m.rgb_format = 1;
            m.color_interlace[Side::Front.index()] = ColorInterlace::Planar;
            m.color_interlace[Side::Back.index()] = ColorInterlace::PlanarReversed;
            m.gray_interlace[Side::Back.index()] = GrayInterlace::Reversed;
            m.duplex_interlace = DuplexInterlace::ByteAlternating;
            m.need_ccal = true;
            m.need_fcal = true;
            m.duplex_offset_side = Side::Back;
            // vpd lies about these
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        patterns: &["DR-2510", "DR-2010"],
        apply: |m| {
            m.rgb_format = 1;
            m.always_op = false;
            m.window_vendor_byte = 0x80;
            m.fixed_width = true;
            m.valid_x = FIXED_VALID_X;
            m.gray_interlace = [GrayInterlace::ThreeHead; 2];
            m.color_interlace = [ColorInterlace::ThreeHead; 2];
            m.duplex_interlace = DuplexInterlace::ThreeHead;
            m.need_ccal = true;
            m.need_fcal = true;
            m.sw_lut = true;
            // only supported in the Y direction
            set_std_res(m, &[100, 150, 200, 240, 400], false);
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        // settings copied from the DR-2510, plus inverted origin
        patterns: &["DR-3010"],
        apply: |m| {
            m.rgb_format = 1;
            m.always_op = false;
            m.window_vendor_byte = 0x80;
            m.fixed_width = true;
            m.valid_x = FIXED_VALID_X;
            m.gray_interlace = [GrayInterlace::ThreeHead; 2];
            m.color_interlace = [ColorInterlace::ThreeHead; 2];
            m.duplex_interlace = DuplexInterlace::ThreeHead;
            m.need_ccal = true;
            m.need_fcal = true;
            m.sw_lut = true;
            m.invert_tly = true;
            set_std_res(m, &[100, 150, 200, 240, 400], false);
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        patterns: &["DR-2050", "DR-2080"],
        apply: |m| {
            m.can_write_panel = false;
            m.has_df = false;
            m.fixed_width = true;
            m.even_bpl = true;
            m.color_interlace = [ColorInterlace::Planar; 2];
            m.duplex_interlace = DuplexInterlace::ByteAlternating;
            m.need_fcal_buffer = true;
            m.bg_color = 0x08;
            m.sw_lut = true;
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        patterns: &["DR-3080"],
        apply: |m| {
            m.can_write_panel = false;
            m.has_df = false;
            m.has_btc = false;
        },
    },
    Quirk {
        patterns: &["DR-5060F"],
        apply: |m| {
            m.can_write_panel = false;
            m.has_df = false;
            m.has_btc = false;
            m.ppl_mod = 32;
            m.reverse_by_mode[Mode::Lineart.index()] = false;
            m.reverse_by_mode[Mode::Halftone.index()] = false;
        },
    },
    Quirk {
        patterns: &["DR-5020"],
        apply: |m| {
            m.can_read_panel = false;
            m.can_write_panel = false;
            m.has_df = false;
            m.has_btc = false;
            m.ppl_mod = 32;
            m.reverse_by_mode[Mode::Lineart.index()] = false;
            m.reverse_by_mode[Mode::Halftone.index()] = false;
        },
    },
    Quirk {
        patterns: &["P-208"],
        apply: |m| {
            m.color_interlace[Side::Front.index()] = ColorInterlace::Planar;
            m.color_interlace[Side::Back.index()] = ColorInterlace::PlanarReversed;
            m.gray_interlace[Side::Back.index()] = GrayInterlace::Reversed;
            m.duplex_interlace = DuplexInterlace::ByteAlternating;
            m.need_ccal = true;
            m.invert_tly = true;
            m.can_color = true;
            m.window_vendor_byte = 0x88;
            m.rgb_format = 1;
            m.ssm_pay_head_len = true;
            m.ppl_mod = 8;
            m.ccal_version = 3;
            m.can_read_sensors = true;
        },
    },
    Quirk {
        patterns: &["P-215"],
        apply: |m| {
            m.color_interlace[Side::Front.index()] = ColorInterlace::PlanarReversed;
            m.color_interlace[Side::Back.index()] = ColorInterlace::Planar;
            m.gray_interlace[Side::Front.index()] = GrayInterlace::Reversed;
            m.duplex_interlace = DuplexInterlace::ByteAlternating;
            m.need_ccal = true;
            m.invert_tly = true;
            m.can_color = true;
            m.window_vendor_byte = 0x88;
            m.rgb_format = 1;
            m.ssm_pay_head_len = true;
            m.ppl_mod = 8;
            m.ccal_version = 3;
            m.can_read_sensors = true;
            m.has_card = true;
        },
    },
    Quirk {
        patterns: &["DR-M160"],
        apply: |m| {
            set_std_res_xy(m, &[100, 150, 200, 300, 400, 600]);
            m.has_comp_jpeg = true;
            m.rgb_format = 1;
            m.can_color = true;
            m.has_df_ultra = true;
            m.color_inter_by_res[dpi_index(100)] = Some(ColorInterlace::Gbr);
            m.color_inter_by_res[dpi_index(150)] = Some(ColorInterlace::Gbr);
            m.color_inter_by_res[dpi_index(200)] = Some(ColorInterlace::Brg);
            m.color_inter_by_res[dpi_index(400)] = Some(ColorInterlace::Gbr);
            m.always_op = false;
            m.fixed_width = true;
            m.invert_tly = true;
            m.can_write_panel = false;
            m.scan_mode_cmd = ScanModeCmd::Ssm2;
            m.duplex_interlace = DuplexInterlace::LineAlternating;
            m.duplex_offset_side = Side::Front;
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        patterns: &["DR-M140"],
        apply: |m| {
            set_std_res_xy(m, &[100, 150, 200, 300, 400, 600]);
            m.has_comp_jpeg = true;
            m.rgb_format = 1;
            m.can_color = true;
            m.has_df_ultra = true;
            m.color_inter_by_res[dpi_index(100)] = Some(ColorInterlace::Gbr);
            m.color_inter_by_res[dpi_index(150)] = Some(ColorInterlace::Gbr);
            m.color_inter_by_res[dpi_index(200)] = Some(ColorInterlace::Brg);
            m.color_inter_by_res[dpi_index(400)] = Some(ColorInterlace::Gbr);
            m.always_op = false;
            m.fixed_width = true;
            m.invert_tly = true;
            m.can_write_panel = false;
            m.scan_mode_cmd = ScanModeCmd::Ssm2;
            m.duplex_interlace = DuplexInterlace::LineAlternating;
            m.duplex_offset_side = Side::Back;
            m.can_halftone = false;
            m.can_mono = false;
        },
    },
    Quirk {
        patterns: &["DR-C125"],
        apply: |m| {
            m.gray_interlace = [GrayInterlace::ThreeHead; 2];
            m.color_interlace = [ColorInterlace::ThreeHead; 2];
            m.duplex_interlace = DuplexInterlace::ThreeHead;
            m.duplex_offset_side = Side::Back;
            m.window_vendor_byte = 0x88;
            m.need_ccal = true;
            m.ccal_version = 3;
            m.need_fcal = true;
            m.sw_lut = true;
            m.can_color = true;
            m.rgb_format = 1;
            set_std_res(m, &[100, 150, 200, 240, 400], false);
            m.always_op = false;
            m.fixed_width = true;
            m.valid_x = FIXED_VALID_X;
        },
    },
    Quirk {
        patterns: &["DR-C225"],
        apply: |m| {
            m.color_interlace[Side::Front.index()] = ColorInterlace::Planar;
            m.color_interlace[Side::Back.index()] = ColorInterlace::PlanarReversed;
            m.gray_interlace[Side::Back.index()] = GrayInterlace::Reversed;
            m.duplex_interlace = DuplexInterlace::ByteAlternating;
            m.window_vendor_byte = 0x88;
            m.need_ccal = true;
            m.ccal_version = 3;
            m.need_fcal = true;
            m.invert_tly = true;
            m.can_color = true;
            m.rgb_format = 1;
            set_std_res(m, &[100, 150, 200, 240, 400], false);
            m.always_op = false;
            m.fixed_width = true;
            m.valid_x = FIXED_VALID_X;
        },
    },
];

/// Patch the model record after VPD parsing.
pub fn apply(model: &mut DeviceModel) {
    // assume the flatbed and usable width match the adf until a table
    // entry says otherwise
    model.valid_x = model.max_x;
    model.max_x_fb = model.max_x;
    model.max_y_fb = model.max_y;

    // color models carry a C in the name; vpd never reports color
    if model.model.contains('C') {
        model.can_color = true;
    }

    for quirk in MODEL_QUIRKS {
        if quirk.patterns.iter().any(|p| model.model.contains(p)) {
            debug!(model = %model.model, pattern = quirk.patterns[0], "applying model quirks");
            (quirk.apply)(model);
            return;
        }
    }

    debug!(model = %model.model, "no model quirks");
}
