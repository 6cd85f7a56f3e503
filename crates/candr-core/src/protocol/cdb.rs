//! Control block layouts for the scanner command set.
//!
//! Offsets and lengths are a wire-compatibility requirement and are
//! reproduced byte-for-byte from the hardware command reference.
//! Builders return fully formed control blocks; payload helpers fill
//! the data-phase blocks that accompany some commands.

use super::bytes::{put_bits, put_n};

/// Fixed USB envelope prepended to every exchange.
pub const USB_HEADER_LEN: usize = 12;
/// Every control block is padded to this length on the USB wire.
pub const USB_COMMAND_LEN: usize = 12;
/// Normal status trailer length.
pub const USB_STATUS_LEN: usize = 4;
/// Extra-status trailer length (residual hint).
pub const USB_EXTRA_STATUS_LEN: usize = 4;

/// Per-phase bulk timeouts, milliseconds.
pub const USB_COMMAND_TIME_MS: u64 = 30_000;
pub const USB_DATA_TIME_MS: u64 = 30_000;
pub const USB_STATUS_TIME_MS: u64 = 30_000;
/// Probe commands use 1/60 of the normal timeout.
pub const USB_PROBE_DIVISOR: u32 = 60;

// ============================================================================
// TEST UNIT READY
// ============================================================================

pub const TEST_UNIT_READY: u8 = 0x00;
pub const TEST_UNIT_READY_LEN: usize = 6;

pub fn test_unit_ready() -> Vec<u8> {
    let mut cdb = vec![0u8; TEST_UNIT_READY_LEN];
    cdb[0] = TEST_UNIT_READY;
    cdb
}

// ============================================================================
// REQUEST SENSE
// ============================================================================

pub const REQUEST_SENSE: u8 = 0x03;
pub const REQUEST_SENSE_LEN: usize = 6;
/// Sense blocks from this family are always 14 bytes.
pub const SENSE_LEN: usize = 0x0e;

pub fn request_sense() -> Vec<u8> {
    let mut cdb = vec![0u8; REQUEST_SENSE_LEN];
    cdb[0] = REQUEST_SENSE;
    cdb[0x04] = SENSE_LEN as u8;
    cdb
}

// ============================================================================
// INQUIRY
// ============================================================================

pub const INQUIRY: u8 = 0x12;
pub const INQUIRY_LEN: usize = 6;
/// Standard page response length.
pub const INQUIRY_STD_LEN: usize = 0x30;
/// Vital product data response length.
pub const INQUIRY_VPD_LEN: usize = 0x1e;
/// VPD page code carrying capability data.
pub const INQUIRY_VPD_PAGE: u8 = 0xf0;

pub fn inquiry(evpd: bool, page_code: u8, return_size: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; INQUIRY_LEN];
    cdb[0] = INQUIRY;
    put_bits(&mut cdb[1], 1, 0, evpd as u8);
    cdb[0x02] = page_code;
    cdb[0x04] = return_size;
    cdb
}

// ============================================================================
// RESERVE / RELEASE UNIT
// ============================================================================

pub const RESERVE_UNIT: u8 = 0x16;
pub const RELEASE_UNIT: u8 = 0x17;
pub const RESERVE_UNIT_LEN: usize = 6;

pub fn reserve_unit() -> Vec<u8> {
    let mut cdb = vec![0u8; RESERVE_UNIT_LEN];
    cdb[0] = RESERVE_UNIT;
    cdb
}

pub fn release_unit() -> Vec<u8> {
    let mut cdb = vec![0u8; RESERVE_UNIT_LEN];
    cdb[0] = RELEASE_UNIT;
    cdb
}

// ============================================================================
// SCAN
// ============================================================================

pub const SCAN: u8 = 0x1b;
pub const SCAN_LEN: usize = 6;

/// Window identifiers, also used as SCAN payload bytes.
pub const WID_FRONT: u8 = 0x00;
pub const WID_BACK: u8 = 0x01;
/// Calibration scan types sent in place of window ids.
pub const SCAN_CAL_LAMP_OFF: u8 = 0xff;
pub const SCAN_CAL_LAMP_ON: u8 = 0xfe;

pub fn scan(xfer_len: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; SCAN_LEN];
    cdb[0] = SCAN;
    cdb[0x04] = xfer_len;
    cdb
}

// ============================================================================
// SET WINDOW
// ============================================================================

pub const SET_WINDOW: u8 = 0x24;
pub const SET_WINDOW_LEN: usize = 10;
/// Window parameter header preceding the descriptor.
pub const WINDOW_HEADER_LEN: usize = 8;
/// Window descriptor block length.
pub const WINDOW_DESC_LEN: usize = 0x2c;

pub fn set_window(xfer_len: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; SET_WINDOW_LEN];
    cdb[0] = SET_WINDOW;
    put_n(&mut cdb, 0x06, 3, xfer_len);
    cdb
}

/// Fill the window-descriptor length into the parameter header.
pub fn set_window_header(header: &mut [u8]) {
    put_n(header, 0x06, 2, WINDOW_DESC_LEN as u32);
}

// ============================================================================
// READ
// ============================================================================

pub const READ: u8 = 0x28;
pub const READ_LEN: usize = 10;

/// READ data types.
pub const DT_IMAGE: u8 = 0x00;
pub const DT_LUT: u8 = 0x03;
pub const DT_PIXELSIZE: u8 = 0x80;
pub const DT_PANEL: u8 = 0x84;
pub const DT_SENSORS: u8 = 0x8b;
pub const DT_COUNTERS: u8 = 0x8c;
pub const DT_FINE_OFFSET: u8 = 0x90;
pub const DT_FINE_GAIN: u8 = 0x91;

/// Fine gain channel selectors (READ uid byte).
pub const FINE_UID_GRAY: u8 = 0x07;
pub const FINE_UID_RED: u8 = 0x0c;
pub const FINE_UID_GREEN: u8 = 0x0a;
pub const FINE_UID_BLUE: u8 = 0x09;

pub const PANEL_LEN: usize = 0x08;
pub const SENSORS_LEN: usize = 0x01;
pub const COUNTERS_LEN: usize = 0x80;

pub fn read(datatype: u8, uid: u8, lid: u8, xfer_len: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; READ_LEN];
    cdb[0] = READ;
    cdb[0x02] = datatype;
    cdb[0x04] = uid;
    cdb[0x05] = lid;
    put_n(&mut cdb, 0x06, 3, xfer_len);
    cdb
}

// ============================================================================
// SEND
// ============================================================================

pub const SEND: u8 = 0x2a;
pub const SEND_LEN: usize = 10;

/// Downloadable LUT payload length and front-side table id.
pub const LUT_LEN: usize = 0x100;
pub const LUT_ID_FRONT: u32 = 0x82;

pub fn send(datatype: u8, id: u32, xfer_len: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; SEND_LEN];
    cdb[0] = SEND;
    cdb[0x02] = datatype;
    put_n(&mut cdb, 0x04, 2, id);
    put_n(&mut cdb, 0x06, 3, xfer_len);
    cdb
}

/// Panel payload: enable-LED bit plus a 4-byte counter.
pub fn panel_payload(enable_led: bool, counter: u32) -> Vec<u8> {
    let mut pay = vec![0u8; PANEL_LEN];
    put_bits(&mut pay[2], 1, 0, enable_led as u8);
    put_n(&mut pay, 0x04, 4, counter);
    pay
}

// ============================================================================
// OBJECT POSITION
// ============================================================================

pub const OBJECT_POSITION: u8 = 0x31;
pub const OBJECT_POSITION_LEN: usize = 10;

pub const OP_DISCHARGE: u8 = 0x00;
pub const OP_FEED: u8 = 0x01;

pub fn object_position(function: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; OBJECT_POSITION_LEN];
    cdb[0] = OBJECT_POSITION;
    put_bits(&mut cdb[0x01], 0x07, 0, function);
    cdb
}

// ============================================================================
// GET / SET SCAN MODE
// ============================================================================

pub const GET_SCAN_MODE: u8 = 0xd5;
pub const SET_SCAN_MODE: u8 = 0xd6;
pub const SCAN_MODE_LEN: usize = 6;

/// Page codes shared by GET/SET SCAN MODE.
pub const SM_PC_ADF: u8 = 0x01;
pub const SM_PC_TPU: u8 = 0x02;
pub const SM_PC_SCAN_CTL: u8 = 0x20;
pub const SM_PC_DF: u8 = 0x30;
pub const SM_PC_BUFFER: u8 = 0x32;
pub const SM_PC_IMPRINTER: u8 = 0x34;
pub const SM_PC_DROPOUT: u8 = 0x36;
pub const SM_PC_ALL: u8 = 0x3f;

/// SET SCAN MODE payload: 1-byte head, page code, page body.
pub const SSM_PAY_LEN: usize = 0x14;
pub const SSM_PAY_HEAD_LEN: u8 = 0x13;
pub const SSM_PAGE_LEN: u8 = 0x0e;

pub fn get_scan_mode(page_code: u8, len: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; SCAN_MODE_LEN];
    cdb[0] = GET_SCAN_MODE;
    cdb[0x02] = page_code;
    cdb[0x04] = len;
    cdb
}

pub fn set_scan_mode(pay_len: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; SCAN_MODE_LEN];
    cdb[0] = SET_SCAN_MODE;
    put_bits(&mut cdb[1], 1, 4, 1); // page format
    cdb[0x04] = pay_len;
    cdb
}

/// Common prefix of every SET SCAN MODE payload.
pub fn ssm_payload(page_code: u8, with_head_len: bool) -> Vec<u8> {
    let mut pay = vec![0u8; SSM_PAY_LEN];
    if with_head_len {
        pay[0x01] = SSM_PAY_HEAD_LEN;
    }
    pay[0x04] = page_code;
    pay[0x05] = SSM_PAGE_LEN;
    pay
}

// SSM page field setters; offsets are within the full payload.

pub fn ssm_df_fields(pay: &mut [u8], roller_deskew: bool, staple: bool, thick: bool, len: bool) {
    put_bits(&mut pay[7], 1, 5, roller_deskew as u8);
    put_bits(&mut pay[7], 1, 4, staple as u8);
    put_bits(&mut pay[7], 1, 2, thick as u8);
    put_bits(&mut pay[7], 1, 0, len as u8);
}

pub fn ssm_buffer_fields(pay: &mut [u8], duplex: bool, async_buf: bool, fb: bool, card: bool) {
    put_bits(&mut pay[6], 1, 1, duplex as u8);
    put_bits(&mut pay[0x0a], 1, 6, async_buf as u8);
    put_bits(&mut pay[0x0a], 1, 4, fb as u8);
    put_bits(&mut pay[0x0a], 1, 3, card as u8);
}

/// Dropout channel codes for the DO pages.
pub const DO_NONE: u8 = 0;
pub const DO_RED: u8 = 1;
pub const DO_GREEN: u8 = 2;
pub const DO_BLUE: u8 = 3;

pub fn ssm_do_fields(pay: &mut [u8], front_do: u8, front_en: u8, back_do: u8, back_en: u8) {
    pay[0x07] = 0x03;
    if (front_do | front_en | back_do | back_en) != DO_NONE {
        pay[0x09] = 0x05;
    }
    pay[0x0b] = front_do;
    pay[0x0c] = back_do;
    pay[0x0d] = front_en;
    pay[0x0e] = back_en;
}

// ============================================================================
// CANCEL
// ============================================================================

pub const CANCEL: u8 = 0xd8;
pub const CANCEL_LEN: usize = 6;

pub fn cancel() -> Vec<u8> {
    let mut cdb = vec![0u8; CANCEL_LEN];
    cdb[0] = CANCEL;
    cdb
}

// ============================================================================
// COARSE CALIBRATION
// ============================================================================

pub const COARSE_CAL: u8 = 0xe1;
pub const COARSE_CAL_LEN: usize = 10;

/// Original payload: one gain/offset per side, doubled exposures.
pub const CC_PAY_LEN: usize = 0x20;
pub const CC_PAY_VER: u8 = 0x00;
/// 'version 3' payload used by newer models: per-channel gain/offset.
pub const CC3_PAY_LEN: usize = 0x28;
pub const CC3_PAY_VER: u8 = 0x03;

pub fn coarse_cal(version: u8, xfer_len: u32) -> Vec<u8> {
    let mut cdb = vec![0u8; COARSE_CAL_LEN];
    cdb[0] = COARSE_CAL;
    cdb[5] = version;
    put_n(&mut cdb, 0x06, 3, xfer_len);
    cdb
}

// ============================================================================
// SET SCAN MODE 2
// ============================================================================

pub const SET_SCAN_MODE2: u8 = 0xe5;
pub const SET_SCAN_MODE2_LEN: usize = 12;
pub const SSM2_PAY_LEN: usize = 0x10;

/// Page codes for SET SCAN MODE 2.
pub const SM2_PC_DF: u8 = 0x00;
pub const SM2_PC_ULTRA: u8 = 0x01;
pub const SM2_PC_BUFFER: u8 = 0x02;
pub const SM2_PC_DROPOUT: u8 = 0x06;

pub fn set_scan_mode2(page_code: u8, pay_len: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; SET_SCAN_MODE2_LEN];
    cdb[0] = SET_SCAN_MODE2;
    cdb[0x02] = page_code;
    cdb[0x08] = pay_len;
    cdb
}

pub fn ssm2_df_fields(pay: &mut [u8], thick: bool, len: bool) {
    put_bits(&mut pay[3], 1, 2, thick as u8);
    put_bits(&mut pay[3], 1, 0, len as u8);
}

pub fn ssm2_ultra_fields(pay: &mut [u8], top: u32, bot: u32) {
    put_n(pay, 0x07, 2, top);
    put_n(pay, 0x09, 2, bot);
}

pub fn ssm2_buffer_fields(pay: &mut [u8], buffermode: bool) {
    pay[0x03] = !buffermode as u8;
    pay[0x06] = 0x40;
    pay[0x09] = !buffermode as u8;
}

pub fn ssm2_do_fields(pay: &mut [u8], dropout: u8, enhance: u8) {
    pay[0x09] = dropout;
    pay[0x0a] = enhance;
}
