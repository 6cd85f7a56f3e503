//! Scan session lifecycle.
//!
//! One `Session` owns one attached device and its channel, and walks
//! the scan through calibration, window programming, the per-side
//! read loop, and cancellation. `start()` is called once per page or
//! side; `read()` drains reconstructed bytes; `cancel()` is honored
//! at the next operation boundary.

use std::fmt;

use tracing::{debug, info, warn};

use crate::calib::{self, CAL_LINES, CalibrationState, EXPOSURE_OVERDRIVE};
use crate::device::registry::Device;
use crate::device::ScanModeCmd;
use crate::error::ScanError;
use crate::image::deinterlace;
use crate::image::reconstruct::{
    self, DumbScanSpec, JpegSofPatcher, LineCorrections,
};
use crate::image::{DuplexInterlace, Mode, Side};
use crate::post::{PageGeometry, crop, deskew, despeckle};
use crate::protocol::bytes::{get_bits, get_n};
use crate::protocol::cdb;
use crate::protocol::window::{CMP_JPEG, CMP_NONE, WindowDescriptor};
use crate::session::lut::load_lut;
use crate::session::params::{
    DropoutColor, Format, ImageParams, ParamsTriple, ScanSettings, Source,
};
use crate::transport::{Channel, Command};

/// Where the session currently stands; used for tracing and the
/// programming-error checks, while the byte counters carry the
/// fine-grained read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Calibrating,
    WindowProgrammed,
    Scanning,
    SideComplete,
    Cancelled,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "IDLE"),
            SessionPhase::Calibrating => write!(f, "CALIBRATING"),
            SessionPhase::WindowProgrammed => write!(f, "WINDOW_PROGRAMMED"),
            SessionPhase::Scanning => write!(f, "SCANNING"),
            SessionPhase::SideComplete => write!(f, "SIDE_COMPLETE"),
            SessionPhase::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Outcome of one `read()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were copied into the caller's buffer.
    Data(usize),
    /// The current side is fully delivered; call `start()` for the
    /// next side or page.
    EndOfSide,
}

/// Front panel state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PanelStatus {
    pub start_pressed: bool,
    pub stop_pressed: bool,
    pub counter: u32,
}

/// Paper path sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorStatus {
    pub card_present: bool,
    pub adf_loaded: bool,
}

pub struct Session {
    device: Device,
    channel: Channel,
    settings: ScanSettings,
    params: ParamsTriple,
    cal: CalibrationState,
    lut: [u8; 256],
    buffers: [Vec<u8>; 2],
    side: Side,
    phase: SessionPhase,
    started: bool,
    cancel_requested: bool,
    /// Page counter value when the previous page finished.
    prev_page: u32,
    panel_counter: u32,
    jpeg: JpegSofPatcher,
}

impl Session {
    pub fn new(device: Device, channel: Channel) -> Self {
        let settings = ScanSettings::for_model(&device.model);
        Self {
            device,
            channel,
            settings,
            params: ParamsTriple::default(),
            cal: CalibrationState::default(),
            lut: load_lut(0, 255, 0, 0),
            buffers: [Vec::new(), Vec::new()],
            side: Side::Front,
            phase: SessionPhase::Idle,
            started: false,
            cancel_requested: false,
            prev_page: 0,
            panel_counter: 0,
            jpeg: JpegSofPatcher::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Change the scan request. Only legal between pages.
    pub fn update_settings(
        &mut self,
        f: impl FnOnce(&mut ScanSettings),
    ) -> Result<(), ScanError> {
        if self.started {
            return Err(ScanError::Invalid("settings change during a scan".into()));
        }
        f(&mut self.settings);
        Ok(())
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Geometry of the data the caller will receive.
    pub fn parameters(&mut self) -> Result<ImageParams, ScanError> {
        if !self.started {
            self.params = ParamsTriple::compute(&self.settings, &self.device.model, false)?;
        }
        Ok(self.params.delivered.clone())
    }

    fn goto_phase(&mut self, next: SessionPhase) {
        if self.phase != next {
            info!(from = %self.phase, to = %next, "session transition");
            self.phase = next;
        }
    }

    /// Begin the next page or side.
    pub fn start(&mut self) -> Result<(), ScanError> {
        debug!(
            started = self.started,
            side = self.side.index(),
            "start"
        );

        // undo any prior cancel request
        self.cancel_requested = false;

        // previous side must be fully delivered first
        if self.started && !self.params.user.eof[self.side.index()] {
            return Err(ScanError::Invalid(
                "start() before previous side finished".into(),
            ));
        }

        let result = if !self.started {
            self.start_batch()
        } else {
            self.start_continuation()
        };

        if let Err(e) = result {
            warn!(error = %e, "start failed, resetting session");
            self.started = false;
            self.cancel_requested = false;
            self.goto_phase(SessionPhase::Idle);
            return Err(e);
        }

        self.jpeg.reset();

        // software page cleanup needs the whole side up front
        if (self.settings.sw_deskew || self.settings.sw_crop || self.settings.sw_despeckle > 0)
            && self.params.scanner.format != Format::Jpeg
        {
            if let Err(e) = self.buffer_whole_side() {
                self.started = false;
                self.cancel_requested = false;
                return Err(e);
            }
            self.postprocess_side(self.side);
        }

        self.check_cancel()?;
        Ok(())
    }

    /// First `start()` of a batch: full device programming.
    fn start_batch(&mut self) -> Result<(), ScanError> {
        self.side = if self.settings.source.is_back_only() { Side::Back } else { Side::Front };

        // eject anything left from an earlier batch; failure is not
        // interesting on an empty path
        if let Err(e) = self.object_position(false) {
            debug!(error = %e, "eject before batch failed");
        }
        self.channel.wait_ready()?;

        // linear tone curve while calibrating
        self.lut = load_lut(0, 255, 0, 0);

        self.goto_phase(SessionPhase::Calibrating);
        self.calibrate_coarse()?;
        self.calibrate_fine()?;
        self.calibrate_fine_buffer()?;

        // reset the page counter now that calibration scans are done
        self.panel_counter = 0;
        self.prev_page = 0;
        if let Err(e) = self.send_panel() {
            debug!(error = %e, "panel reset failed");
        }

        self.params = ParamsTriple::compute(&self.settings, &self.device.model, false)?;

        // the device may be unable to scan the requested geometry;
        // reconstruction resamples, at some precision cost
        if self.params.scanner.dpi_x != self.params.user.dpi_x
            || self.params.scanner.width != self.params.user.width
        {
            debug!(
                scan_dpi = self.params.scanner.dpi_x,
                scan_width = self.params.scanner.width,
                out_dpi = self.params.user.dpi_x,
                out_width = self.params.user.width,
                "device geometry differs from request, resampling"
            );
        }

        self.set_window()?;
        self.ssm_buffer()?;
        self.ssm_dropout()?;
        self.ssm_double_feed()?;
        self.goto_phase(SessionPhase::WindowProgrammed);

        self.params.clean();
        self.alloc_buffers();

        // now the user's tone curve
        self.lut = load_lut(0, 255, self.settings.contrast, self.settings.brightness);

        // card readers dislike object position
        if !self.settings.source.is_card() {
            self.object_position(true)?;
            self.channel.wait_ready()?;
        }

        self.start_scan(None)?;
        self.goto_phase(SessionPhase::Scanning);
        self.started = true;
        Ok(())
    }

    /// Subsequent `start()`: swap sides, feed the next sheet.
    fn start_continuation(&mut self) -> Result<(), ScanError> {
        if self.params.scanner.source.is_duplex() {
            self.side = self.side.other();
        }

        self.params.reset_delivered_geometry();

        // the back of a duplex page is already buffered; everything
        // else needs new paper
        if self.side == Side::Front || self.settings.source.is_back_only() {
            self.params.clean();

            if self.device.model.always_op || !self.settings.buffer_mode {
                self.object_position(true)?;
                if !self.settings.buffer_mode {
                    self.start_scan(None)?;
                }
            } else {
                // buffering scanners signal more pages via the counter
                let panel = self.read_panel()?;
                self.panel_counter = panel.counter;
                if self.prev_page == self.panel_counter {
                    debug!(counter = self.prev_page, "counter unchanged, out of paper");
                    return Err(ScanError::NoDocs);
                }
                debug!(
                    prev = self.prev_page,
                    counter = self.panel_counter,
                    "counter advanced"
                );
            }
        }

        self.goto_phase(SessionPhase::Scanning);
        Ok(())
    }

    /// Pull one block of image data into `out`.
    pub fn read(&mut self, out: &mut [u8]) -> Result<ReadOutcome, ScanError> {
        if !self.started {
            return Err(ScanError::Cancelled);
        }

        let side = self.side;

        // side fully delivered
        if self.params.user.bytes_sent[side.index()]
            == self.params.delivered.bytes_tot[side.index()]
        {
            self.params.user.eof[side.index()] = true;
            self.goto_phase(SessionPhase::SideComplete);
            return Ok(ReadOutcome::EndOfSide);
        }

        let result = self.pump_scanner();
        if let Err(e) = result {
            warn!(error = %e, "read failed, resetting session");
            self.started = false;
            self.cancel_requested = false;
            self.goto_phase(SessionPhase::Idle);
            return Err(e);
        }

        let n = self.read_from_buffer(out, side);
        self.check_cancel()?;
        Ok(ReadOutcome::Data(n))
    }

    /// Request cancellation. The session handle admits no concurrent
    /// calls, so nothing is ever in flight when this runs and the
    /// device is told to abort right away; the pending flag still
    /// covers the path where a transport call returns into a queued
    /// cancel.
    pub fn cancel(&mut self) {
        info!("cancel requested");
        self.cancel_requested = true;
        let _ = self.check_cancel();
    }

    /// End the session, aborting any scan in progress.
    pub fn close(mut self) -> Device {
        if self.started {
            self.cancel_requested = true;
            let _ = self.check_cancel();
        }
        self.buffers = [Vec::new(), Vec::new()];
        self.device
    }

    /// One blocking pull from the device into the side buffers.
    fn pump_scanner(&mut self) -> Result<(), ScanError> {
        let duplex_interlaced = self.params.scanner.source.is_duplex()
            && self.params.scanner.format != Format::Jpeg
            && self.device.model.duplex_interlace != DuplexInterlace::None;

        if duplex_interlaced {
            if !self.params.scanner.eof[0] || !self.params.scanner.eof[1] {
                self.read_from_scanner_duplex(false)?;
                if self.params.scanner.eof[0] && self.params.scanner.eof[1] {
                    self.prev_page += 1;
                    debug!(page = self.prev_page, "duplex page complete");
                }
            }
        } else if !self.params.scanner.eof[self.side.index()] {
            self.read_from_scanner(self.side, false)?;
            if self.params.scanner.eof[self.side.index()] {
                self.prev_page += 1;
                debug!(page = self.prev_page, side = self.side.index(), "side complete");
            }
        }
        Ok(())
    }

    /// Read until the current side (or both duplex sides) hit eof.
    fn buffer_whole_side(&mut self) -> Result<(), ScanError> {
        while !self.params.scanner.eof[self.side.index()] {
            self.pump_scanner()?;
        }
        Ok(())
    }

    // --- device commands ----------------------------------------------

    fn object_position(&mut self, load: bool) -> Result<(), ScanError> {
        if self.settings.source == Source::Flatbed {
            debug!("object position: flatbed no-op");
            return Ok(());
        }
        debug!(load, "object position");
        let cdb =
            cdb::object_position(if load { cdb::OP_FEED } else { cdb::OP_DISCHARGE });
        self.channel.execute(Command::simple(&cdb))?;
        Ok(())
    }

    /// Tell the device to start scanning. Calibration passes send a
    /// lamp-control byte in place of the window ids.
    fn start_scan(&mut self, cal_type: Option<u8>) -> Result<(), ScanError> {
        let mut out = vec![cdb::WID_FRONT, cdb::WID_BACK];
        if let Some(t) = cal_type {
            out = vec![t, t];
        }

        if !self.params.scanner.source.is_duplex() {
            out.truncate(1);
            if self.params.scanner.source.is_back_only() && cal_type.is_none() {
                out[0] = cdb::WID_BACK;
            }
        }

        debug!(ids = ?out, "start scan");
        let cdb = cdb::scan(out.len() as u8);
        self.channel.execute(Command::with_out(&cdb, &out))?;
        Ok(())
    }

    fn set_window(&mut self) -> Result<(), ScanError> {
        let model = &self.device.model;
        let s = &self.params.scanner;

        let mut desc = WindowDescriptor {
            wid: if s.source.is_back_only() { cdb::WID_BACK } else { cdb::WID_FRONT },
            x_res: s.dpi_x,
            y_res: s.dpi_y,
            length: s.height * 1200 / s.dpi_y,
            composition: s.mode.index() as u8,
            bits_per_pixel: if s.bpp == 24 { 8 } else { s.bpp as u8 },
            rgb_order: model.rgb_format,
            vendor_byte: model.window_vendor_byte,
            compress_type: CMP_NONE,
            compress_arg: 0,
            ..Default::default()
        };

        // fixed-width machines take the whole sensor; flatbeds align
        // left; adf windows are centered by the host
        if model.fixed_width {
            desc.ul_x = 0;
            desc.width = model.max_x;
        } else if s.source == Source::Flatbed {
            desc.ul_x = s.tl_x;
            desc.width = s.width * 1200 / s.dpi_x;
        } else {
            desc.ul_x = (model.max_x - s.page_x) / 2 + s.tl_x;
            desc.width = s.width * 1200 / s.dpi_x;
        }

        desc.ul_y = if model.invert_tly { !s.tl_y } else { s.tl_y };

        if model.has_btc {
            desc.brightness = (self.settings.brightness + 128) as u8;
            desc.threshold = self.settings.threshold;
            desc.contrast = (self.settings.contrast + 128) as u8;
        }

        if s.format == Format::Jpeg {
            desc.compress_type = CMP_JPEG;
            desc.compress_arg = self.settings.compress_arg;
        }

        let mut out = vec![0u8; cdb::WINDOW_HEADER_LEN];
        cdb::set_window_header(&mut out);
        out.extend_from_slice(&desc.to_bytes());

        let cmd = cdb::set_window(out.len() as u32);
        debug!(len = out.len(), "set window front");
        self.channel.execute(Command::with_out(&cmd, &out))?;

        if s.source.is_duplex() {
            let mut out = vec![0u8; cdb::WINDOW_HEADER_LEN];
            cdb::set_window_header(&mut out);
            desc.wid = cdb::WID_BACK;
            out.extend_from_slice(&desc.to_bytes());
            debug!("set window back");
            self.channel.execute(Command::with_out(&cmd, &out))?;
        }

        Ok(())
    }

    fn ssm_buffer(&mut self) -> Result<(), ScanError> {
        let model = &self.device.model;
        match model.scan_mode_cmd {
            ScanModeCmd::Ssm => {
                let cmd = cdb::set_scan_mode(cdb::SSM_PAY_LEN as u8);
                let mut pay = cdb::ssm_payload(cdb::SM_PC_BUFFER, model.ssm_pay_head_len);
                cdb::ssm_buffer_fields(
                    &mut pay,
                    self.params.scanner.source.is_duplex(),
                    self.settings.buffer_mode,
                    self.params.scanner.source == Source::Flatbed,
                    self.params.scanner.source.is_card(),
                );
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::Ssm2 => {
                let cmd = cdb::set_scan_mode2(cdb::SM2_PC_BUFFER, cdb::SSM2_PAY_LEN as u8);
                let mut pay = vec![0u8; cdb::SSM2_PAY_LEN];
                cdb::ssm2_buffer_fields(&mut pay, self.settings.buffer_mode);
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::None => debug!("scan mode buffer page unsupported"),
        }
        Ok(())
    }

    fn ssm_double_feed(&mut self) -> Result<(), ScanError> {
        let model = &self.device.model;
        if !model.has_df {
            debug!("double feed detection unsupported");
            return Ok(());
        }

        match model.scan_mode_cmd {
            ScanModeCmd::Ssm => {
                let cmd = cdb::set_scan_mode(cdb::SSM_PAY_LEN as u8);
                let mut pay = cdb::ssm_payload(cdb::SM_PC_DF, model.ssm_pay_head_len);
                cdb::ssm_df_fields(
                    &mut pay,
                    self.settings.roller_deskew,
                    self.settings.staple_detect,
                    self.settings.df_thickness,
                    self.settings.df_length,
                );
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::Ssm2 => {
                // ultrasonic offsets go out first when supported
                if self.settings.df_thickness && model.has_df_ultra {
                    let cmd = cdb::set_scan_mode2(cdb::SM2_PC_ULTRA, cdb::SSM2_PAY_LEN as u8);
                    let mut pay = vec![0u8; cdb::SSM2_PAY_LEN];
                    cdb::ssm2_ultra_fields(&mut pay, 0, 0);
                    self.channel.execute(Command::with_out(&cmd, &pay))?;
                }

                let cmd = cdb::set_scan_mode2(cdb::SM2_PC_DF, cdb::SSM2_PAY_LEN as u8);
                let mut pay = vec![0u8; cdb::SSM2_PAY_LEN];
                cdb::ssm2_df_fields(
                    &mut pay,
                    self.settings.df_thickness,
                    self.settings.df_length,
                );
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::None => debug!("double feed page unsupported"),
        }
        Ok(())
    }

    fn ssm_dropout(&mut self) -> Result<(), ScanError> {
        let model = &self.device.model;
        if !model.can_color {
            debug!("dropout unsupported");
            return Ok(());
        }

        let code = |c: DropoutColor| -> (u8, u8) {
            match c {
                DropoutColor::None => (cdb::DO_NONE, cdb::DO_NONE),
                DropoutColor::Red => (cdb::DO_RED, cdb::DO_NONE),
                DropoutColor::Green => (cdb::DO_GREEN, cdb::DO_NONE),
                DropoutColor::Blue => (cdb::DO_BLUE, cdb::DO_NONE),
                DropoutColor::EnhanceRed => (cdb::DO_NONE, cdb::DO_RED),
                DropoutColor::EnhanceGreen => (cdb::DO_NONE, cdb::DO_GREEN),
                DropoutColor::EnhanceBlue => (cdb::DO_NONE, cdb::DO_BLUE),
            }
        };
        let (f_do, f_en) = code(self.settings.dropout_front);
        let (b_do, b_en) = code(self.settings.dropout_back);

        match model.scan_mode_cmd {
            ScanModeCmd::Ssm => {
                let cmd = cdb::set_scan_mode(cdb::SSM_PAY_LEN as u8);
                let mut pay = cdb::ssm_payload(cdb::SM_PC_DROPOUT, model.ssm_pay_head_len);
                cdb::ssm_do_fields(&mut pay, f_do, f_en, b_do, b_en);
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::Ssm2 => {
                let cmd = cdb::set_scan_mode2(cdb::SM2_PC_DROPOUT, cdb::SSM2_PAY_LEN as u8);
                let mut pay = vec![0u8; cdb::SSM2_PAY_LEN];
                cdb::ssm2_do_fields(&mut pay, f_do, f_en);
                self.channel.execute(Command::with_out(&cmd, &pay))?;
            }
            ScanModeCmd::None => debug!("dropout page unsupported"),
        }
        Ok(())
    }

    /// Read the front panel block: buttons and the page counter.
    pub fn read_panel(&mut self) -> Result<PanelStatus, ScanError> {
        if !self.device.model.can_read_panel {
            return Ok(PanelStatus::default());
        }
        let cmd = cdb::read(cdb::DT_PANEL, 0, 0, cdb::PANEL_LEN as u32);
        let resp = self.channel.execute(Command::with_in(&cmd, cdb::PANEL_LEN))?;
        if resp.data.len() < cdb::PANEL_LEN {
            return Err(ScanError::Io("short panel response".into()));
        }
        Ok(PanelStatus {
            start_pressed: get_bits(resp.data[0], 1, 7) != 0,
            stop_pressed: get_bits(resp.data[0], 1, 6) != 0,
            counter: get_n(&resp.data, 0x04, 4),
        })
    }

    /// Write the panel block back, mainly to reset the counter.
    fn send_panel(&mut self) -> Result<(), ScanError> {
        if !self.device.model.can_write_panel {
            return Ok(());
        }
        let cmd = cdb::send(cdb::DT_PANEL, 0, cdb::PANEL_LEN as u32);
        let pay = cdb::panel_payload(true, self.panel_counter);
        self.channel.execute(Command::with_out(&cmd, &pay))?;
        Ok(())
    }

    /// Read the paper-path sensors.
    pub fn read_sensors(&mut self) -> Result<SensorStatus, ScanError> {
        if !self.device.model.can_read_sensors {
            return Ok(SensorStatus::default());
        }
        let cmd = cdb::read(cdb::DT_SENSORS, 0, 0, cdb::SENSORS_LEN as u32);
        let resp = self.channel.execute(Command::with_in(&cmd, cdb::SENSORS_LEN))?;
        if resp.data.is_empty() {
            return Err(ScanError::Io("short sensor response".into()));
        }
        Ok(SensorStatus {
            card_present: get_bits(resp.data[0], 1, 3) != 0,
            adf_loaded: get_bits(resp.data[0], 1, 0) != 0,
        })
    }

    // --- calibration --------------------------------------------------

    /// Swap in the short duplex calibration window, returning the
    /// fields to restore afterwards.
    fn push_cal_settings(&mut self, force_color: bool) -> (u32, u32, Mode, Source) {
        let saved = (
            self.settings.tl_y,
            self.settings.br_y,
            self.settings.mode,
            self.settings.source,
        );
        self.settings.tl_y = 0;
        self.settings.br_y = CAL_LINES * 1200 / self.settings.dpi_y;
        if force_color {
            self.settings.mode = Mode::Color;
        }
        self.settings.source = Source::AdfDuplex;
        saved
    }

    fn pop_cal_settings(&mut self, saved: (u32, u32, Mode, Source)) {
        self.settings.tl_y = saved.0;
        self.settings.br_y = saved.1;
        self.settings.mode = saved.2;
        self.settings.source = saved.3;
    }

    /// Coarse AFE calibration: offset, exposure, then gain, each from
    /// a short scan with the previous values applied.
    fn calibrate_coarse(&mut self) -> Result<(), ScanError> {
        if !self.device.model.need_ccal {
            debug!("coarse calibration not required");
            return Ok(());
        }

        let user_mode = self.settings.mode;
        let saved = self.push_cal_settings(true);

        let result = (|| -> Result<(), ScanError> {
            self.params = ParamsTriple::compute(&self.settings, &self.device.model, true)?;
            let (dpi, mode) = (self.params.scanner.dpi_x, self.params.scanner.mode);

            if self.cal.coarse_is_current(dpi, mode) {
                debug!("coarse calibration already done");
                return Ok(());
            }
            info!(dpi, "coarse calibration");

            self.params.clean();
            self.alloc_buffers();
            self.cal.clear_fine();

            self.ssm_buffer()?;
            self.set_window()?;

            // pass 1: lamp off, neutral afe, find the black offset
            self.cal.reset_coarse();
            self.write_afe()?;
            self.calibration_scan(cdb::SCAN_CAL_LAMP_OFF)?;
            for side in Side::BOTH {
                let min = calib::min_sample(
                    &self.buffers[side.index()],
                    self.params.scanner.valid_bpl,
                );
                self.cal.c_offset[side.index()] = calib::derive_offset(min);
            }
            calib::trace_coarse(&self.cal, "offset");

            // pass 2: lamp on, deliberately over-driven exposure
            for side in 0..2 {
                self.cal.c_exposure[side] = [EXPOSURE_OVERDRIVE; 3];
            }
            self.write_afe()?;
            self.calibration_scan(cdb::SCAN_CAL_LAMP_ON)?;
            for side in Side::BOTH {
                for chan in 0..3 {
                    let peak = calib::max_channel_sample(
                        &self.buffers[side.index()],
                        self.params.scanner.valid_bpl,
                        chan,
                    );
                    self.cal.c_exposure[side.index()][chan] = calib::derive_exposure(
                        self.cal.c_exposure[side.index()][chan],
                        peak,
                        user_mode,
                    );
                }
            }
            calib::trace_coarse(&self.cal, "exposure");

            // pass 3: gain against the exposure found above
            self.write_afe()?;
            self.calibration_scan(cdb::SCAN_CAL_LAMP_ON)?;
            for side in Side::BOTH {
                let peak = calib::max_sample(
                    &self.buffers[side.index()],
                    self.params.scanner.valid_bpl,
                );
                self.cal.c_gain[side.index()] = calib::derive_gain(peak, user_mode);
            }
            calib::trace_coarse(&self.cal, "gain");

            self.write_afe()?;
            self.cal.record_coarse(dpi, mode);
            Ok(())
        })();

        self.pop_cal_settings(saved);
        result
    }

    /// Fine calibration from scans: full-width offset and gain curves
    /// averaged over a few lines per pixel.
    fn calibrate_fine(&mut self) -> Result<(), ScanError> {
        if !self.device.model.need_fcal {
            debug!("fine calibration not required");
            return Ok(());
        }

        let saved = self.push_cal_settings(false);

        let result = (|| -> Result<(), ScanError> {
            self.params = ParamsTriple::compute(&self.settings, &self.device.model, true)?;
            let (dpi, mode) = (self.params.scanner.dpi_x, self.params.scanner.mode);

            if self.cal.fine_is_current(dpi, mode) {
                debug!("fine calibration already done");
                return Ok(());
            }
            info!(dpi, ?mode, "fine calibration");

            self.params.clean();
            self.alloc_buffers();
            self.cal.clear_fine();

            self.ssm_buffer()?;
            self.set_window()?;

            let bpl = self.params.scanner.bpl;
            let valid_bpl = self.params.scanner.valid_bpl;

            // lamp off for the offset curve
            self.calibration_scan(cdb::SCAN_CAL_LAMP_OFF)?;
            for side in Side::BOTH {
                let curve = calib::average_curve(
                    &self.buffers[side.index()],
                    bpl,
                    valid_bpl,
                    CAL_LINES,
                );
                self.cal.f_offset[side.index()] = Some(curve);
            }

            // lamp on for the gain curve
            self.calibration_scan(cdb::SCAN_CAL_LAMP_ON)?;
            for side in Side::BOTH {
                let mut curve = calib::average_curve(
                    &self.buffers[side.index()],
                    bpl,
                    valid_bpl,
                    CAL_LINES,
                );
                calib::floor_curve(&mut curve, valid_bpl);
                self.cal.f_gain[side.index()] = Some(curve);
            }

            self.cal.record_fine(dpi, mode);
            Ok(())
        })();

        self.pop_cal_settings(saved);
        result
    }

    /// Fine calibration from the device's internal buffer: dedicated
    /// reads, duplex-interleaved, one per channel in color.
    fn calibrate_fine_buffer(&mut self) -> Result<(), ScanError> {
        if !self.device.model.need_fcal_buffer {
            debug!("buffered fine calibration not required");
            return Ok(());
        }

        let saved = self.push_cal_settings(false);
        // one line is enough to key the cache
        self.settings.br_y = 1200 / self.settings.dpi_y;

        let result = (|| -> Result<(), ScanError> {
            self.params = ParamsTriple::compute(&self.settings, &self.device.model, true)?;
            let (dpi, mode) = (self.params.scanner.dpi_x, self.params.scanner.mode);

            if self.cal.fine_is_current(dpi, mode) {
                debug!("buffered fine calibration already done");
                return Ok(());
            }
            info!(dpi, ?mode, "buffered fine calibration");

            self.params.clean();

            let color = self.params.scanner.format == Format::Rgb;
            let valid_width = self.params.scanner.valid_width as usize;
            let bpl = self.params.scanner.bpl;
            let req_len = self.params.scanner.width as usize * 2;
            let lid = (dpi / 10) as u8;

            // per-pixel offsets, front and back interleaved
            let cmd = cdb::read(cdb::DT_FINE_OFFSET, 0, lid, req_len as u32);
            let resp = self.channel.execute(Command::with_in(&cmd, req_len))?;
            if resp.data.len() < req_len {
                return Err(ScanError::Io("short fine offset read".into()));
            }
            for side in Side::BOTH {
                let mut curve =
                    calib::expand_device_offset(&resp.data, side, valid_width, color);
                curve.resize(bpl, 0);
                self.cal.f_offset[side.index()] = Some(curve);
            }

            // per-pixel gains; color models keep one buffer per channel
            if color {
                let mut curves = [vec![0u8; bpl], vec![0u8; bpl]];
                let uids =
                    [cdb::FINE_UID_RED, cdb::FINE_UID_GREEN, cdb::FINE_UID_BLUE];
                for (chan, &uid) in uids.iter().enumerate() {
                    let cmd = cdb::read(cdb::DT_FINE_GAIN, uid, lid, req_len as u32);
                    let resp = self.channel.execute(Command::with_in(&cmd, req_len))?;
                    if resp.data.len() < req_len {
                        return Err(ScanError::Io("short fine gain read".into()));
                    }
                    for side in Side::BOTH {
                        calib::merge_device_gain(
                            &mut curves[side.index()],
                            &resp.data,
                            side,
                            valid_width,
                            chan,
                        );
                    }
                }
                let [front, back] = curves;
                self.cal.f_gain = [Some(front), Some(back)];
            } else {
                let cmd =
                    cdb::read(cdb::DT_FINE_GAIN, cdb::FINE_UID_GRAY, lid, req_len as u32);
                let resp = self.channel.execute(Command::with_in(&cmd, req_len))?;
                if resp.data.len() < req_len {
                    return Err(ScanError::Io("short fine gain read".into()));
                }
                for side in Side::BOTH {
                    let mut curve =
                        calib::expand_device_gain_gray(&resp.data, side, valid_width);
                    curve.resize(bpl, 0);
                    self.cal.f_gain[side.index()] = Some(curve);
                }
            }

            self.cal.record_fine(dpi, mode);
            Ok(())
        })();

        self.pop_cal_settings(saved);
        result
    }

    /// Push the coarse AFE values into the device registers.
    fn write_afe(&mut self) -> Result<(), ScanError> {
        let version = self.device.model.ccal_version;
        let pay = calib::afe_payload(version, &self.cal);
        let cmd = cdb::coarse_cal(
            if version == 3 { cdb::CC3_PAY_VER } else { cdb::CC_PAY_VER },
            pay.len() as u32,
        );
        self.channel.execute(Command::with_out(&cmd, &pay))?;
        Ok(())
    }

    /// Run one calibration scan and ingest the whole duplex image.
    fn calibration_scan(&mut self, scan_type: u8) -> Result<(), ScanError> {
        self.params.clean();
        self.start_scan(Some(scan_type))?;
        while !self.params.scanner.eof[0] && !self.params.scanner.eof[1] {
            self.read_from_scanner_duplex(true)?;
        }
        Ok(())
    }

    // --- data path ----------------------------------------------------

    fn alloc_buffers(&mut self) {
        for side in Side::BOTH {
            let total = self.params.delivered.bytes_tot[side.index()];
            // fresh allocation every batch; never resized in place
            self.buffers[side.index()] = vec![0u8; total];
        }
    }

    /// Read one block of one side from the device.
    fn read_from_scanner(&mut self, side: Side, exact: bool) -> Result<(), ScanError> {
        let bpl = self.params.scanner.bpl;
        let remain = self.params.scanner.remaining(side);

        let mut bytes = self.device.model.buffer_size;
        bytes -= bytes % bpl;
        if bytes % 2 == 1 {
            bytes -= bpl;
        }
        // image reads deliberately over-request and let the device
        // report the shortfall; calibration wants exact lengths
        if exact && bytes > remain {
            bytes = remain;
        }

        debug!(
            side = side.index(),
            tot = self.params.scanner.bytes_tot[side.index()],
            sent = self.params.scanner.bytes_sent[side.index()],
            req = bytes,
            exact,
            "read from scanner"
        );

        let cmd = cdb::read(cdb::DT_IMAGE, 0, 0, bytes as u32);
        let resp = match self.channel.execute(Command::with_in(&cmd, bytes)) {
            Ok(r) => r,
            Err(ScanError::Busy) => {
                debug!("device busy, returning empty read");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut data = resp.data;
        let mut end_of_data = resp.end_of_data;

        // compressed streams carry zeroed dimensions in their header
        if self.params.scanner.format == Format::Jpeg {
            let (h, w) = (self.params.scanner.height, self.params.scanner.width);
            self.jpeg.patch(&mut data, h, w);
        }

        // the device may send more than this side still needs
        if data.len() > remain {
            data.truncate(remain);
        }

        if !data.is_empty() {
            self.copy_simplex(&data, side);
        }

        // a full exact read ends the scan without an eof from the
        // device; eject and pretend
        if exact && data.len() == remain {
            debug!("exact read complete, clearing feeder");
            self.object_position(false)?;
            end_of_data = true;
        }

        if end_of_data {
            self.finish_side_at_eof(side);
        }

        Ok(())
    }

    /// Read one double-wide block carrying both duplex sides.
    fn read_from_scanner_duplex(&mut self, exact: bool) -> Result<(), ScanError> {
        let bpl = self.params.scanner.bpl;
        let remain =
            self.params.scanner.remaining(Side::Front) + self.params.scanner.remaining(Side::Back);

        let mut bytes = self.device.model.buffer_size;
        bytes -= bytes % (bpl * 2);
        if exact && bytes > remain {
            bytes = remain;
        }

        debug!(req = bytes, remain, exact, "duplex read from scanner");

        let cmd = cdb::read(cdb::DT_IMAGE, 0, 0, bytes as u32);
        let resp = match self.channel.execute(Command::with_in(&cmd, bytes)) {
            Ok(r) => r,
            Err(ScanError::Busy) => {
                debug!("device busy, returning empty read");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut data = resp.data;
        let mut end_of_data = resp.end_of_data;

        if data.len() > remain {
            data.truncate(remain);
        }

        if !data.is_empty() {
            let (front, back) = deinterlace::split_duplex(
                &data,
                bpl,
                self.device.model.duplex_interlace,
            );
            self.copy_simplex(&front, Side::Front);
            self.copy_simplex(&back, Side::Back);
        }

        if exact && data.len() == remain {
            debug!("exact duplex read complete, clearing feeder");
            self.object_position(false)?;
            end_of_data = true;
        }

        if end_of_data {
            self.finish_side_at_eof(Side::Front);
            self.finish_side_at_eof(Side::Back);
        }

        Ok(())
    }

    /// End-of-data handling: repair any shortfall by replicating the
    /// last delivered line, and reconcile the counters. Compressed
    /// streams only learn their final size here.
    fn finish_side_at_eof(&mut self, side: Side) {
        let i = side.index();

        if self.params.scanner.format == Format::Jpeg {
            let sent = self.params.delivered.bytes_sent[i];
            self.params.scanner.bytes_tot[i] = self.params.scanner.bytes_sent[i];
            self.params.delivered.bytes_tot[i] = sent;
            self.params.user.bytes_tot[i] = sent;
        } else {
            let bpl = self.params.delivered.bpl;
            let tot = self.params.delivered.bytes_tot[i];
            let mut sent = self.params.delivered.bytes_sent[i];

            if sent < tot {
                debug!(side = i, sent, tot, "padding short page");
            }
            while sent < tot {
                if sent >= bpl {
                    let (src, dst) = (sent - bpl, sent);
                    let end = (dst + bpl).min(tot);
                    self.buffers[i].copy_within(src..src + (end - dst), dst);
                }
                sent += bpl;
            }
            self.params.delivered.bytes_sent[i] = tot;
            self.params.scanner.finish_side(side);
        }

        self.params.scanner.eof[i] = true;
        self.params.delivered.eof[i] = true;
    }

    /// Descramble a simplex block line by line into the side buffer.
    fn copy_simplex(&mut self, data: &[u8], side: Side) {
        let s = &self.params.scanner;
        let bpl = s.bpl;

        // jpeg never passes through the line machinery
        if s.format == Format::Jpeg {
            let i = side.index();
            let at = self.params.delivered.bytes_sent[i];
            let end = (at + data.len()).min(self.buffers[i].len());
            self.buffers[i][at..end].copy_from_slice(&data[..end - at]);
            self.params.delivered.bytes_sent[i] += data.len();
            self.params.scanner.bytes_sent[i] += data.len();
            return;
        }

        for chunk in data.chunks(bpl) {
            if chunk.len() < bpl {
                break;
            }

            let line_num = self.params.scanner.bytes_sent[side.index()] / bpl;
            self.params.scanner.bytes_sent[side.index()] += bpl;

            // leading device padding and trailing overshoot
            let skip = self.params.delivered.skip_lines[side.index()];
            if line_num < skip
                || line_num - skip >= self.params.delivered.height as usize
            {
                continue;
            }

            let s = &self.params.scanner;
            let mut line = match s.format {
                Format::Gray => deinterlace::gray_line(
                    chunk,
                    self.device.model.gray_interlace[side.index()],
                ),
                Format::Rgb => deinterlace::color_line(
                    chunk,
                    s.width as usize,
                    self.device.model.color_interlace_at(side, s.dpi_x),
                ),
                Format::Jpeg => unreachable!(),
            };

            let corrections = LineCorrections {
                invert: self.device.model.reverse_by_mode[s.mode.index()],
                fine_offset: self.cal.fine_offset(side),
                fine_gain: self.cal.fine_gain(side),
                lut: if self.device.model.sw_lut
                    && (s.mode == Mode::Color || s.mode == Mode::Gray)
                {
                    Some(&self.lut)
                } else {
                    None
                },
                valid_bpl: s.valid_bpl,
            };
            reconstruct::apply_corrections(&mut line, &corrections);

            self.copy_line(&line, side);
        }
    }

    /// Store one corrected line, converting geometry when the device
    /// could not scan what the caller asked for.
    fn copy_line(&mut self, line: &[u8], side: Side) {
        let s = &self.params.scanner;
        let d = &self.params.delivered;
        let i = side.index();

        let spec = DumbScanSpec {
            scan_width: s.width as usize,
            scan_dpi_x: s.dpi_x,
            scan_mode: s.mode,
            out_width: d.width as usize,
            out_bpl: d.bpl,
            out_dpi_x: d.dpi_x,
            out_mode: d.mode,
            offset_pixels: if s.width != d.width {
                ((self.device.model.valid_x - d.page_x) / 2 + d.tl_x) as usize
                    * d.dpi_x as usize
                    / 1200
            } else {
                0
            },
            threshold: self.settings.threshold,
        };

        if spec.is_noop() {
            let at = self.params.delivered.bytes_sent[i];
            let n = spec
                .out_bpl
                .min(line.len())
                .min(self.buffers[i].len().saturating_sub(at));
            self.buffers[i][at..at + n].copy_from_slice(&line[..n]);
            self.params.delivered.bytes_sent[i] += n;
            return;
        }

        let out = reconstruct::reconcile_line(line, &spec);
        let at = self.params.delivered.bytes_sent[i];
        let n = out.len().min(self.buffers[i].len().saturating_sub(at));
        self.buffers[i][at..at + n].copy_from_slice(&out[..n]);
        self.params.delivered.bytes_sent[i] += n;
    }

    /// Hand buffered bytes to the caller.
    fn read_from_buffer(&mut self, out: &mut [u8], side: Side) -> usize {
        let i = side.index();
        let remain =
            self.params.delivered.bytes_sent[i] - self.params.user.bytes_sent[i];
        let n = out.len().min(remain);

        if n == 0 {
            debug!("nothing buffered to hand out");
            return 0;
        }

        let at = self.params.user.bytes_sent[i];
        out[..n].copy_from_slice(&self.buffers[i][at..at + n]);
        self.params.user.bytes_sent[i] += n;
        n
    }

    /// Honor a pending cancel: abort the device and eject.
    fn check_cancel(&mut self) -> Result<(), ScanError> {
        if self.started && self.cancel_requested {
            info!("cancelling scan");

            let cmd = cdb::cancel();
            if let Err(e) = self.channel.execute(Command::simple(&cmd)) {
                debug!(error = %e, "cancel command failed, ignoring");
            }
            if let Err(e) = self.object_position(false) {
                debug!(error = %e, "eject after cancel failed, ignoring");
            }

            self.started = false;
            self.cancel_requested = false;
            self.goto_phase(SessionPhase::Cancelled);
            return Err(ScanError::Cancelled);
        }
        if self.cancel_requested {
            self.cancel_requested = false;
            self.goto_phase(SessionPhase::Cancelled);
            return Err(ScanError::Cancelled);
        }
        Ok(())
    }

    /// Run the optional software cleanup over a fully buffered side.
    fn postprocess_side(&mut self, side: Side) {
        let d = &self.params.delivered;
        let mut geometry = PageGeometry {
            width: d.width as usize,
            height: d.height as usize,
            bpl: d.bpl,
            mode: d.mode,
            dpi_x: d.dpi_x,
            dpi_y: d.dpi_y,
        };
        let i = side.index();

        if self.settings.sw_deskew {
            let bg = self.lut[self.device.model.bg_color as usize];
            deskew::deskew(&mut self.buffers[i], &geometry, bg, self.settings.threshold);
        }

        if self.settings.sw_crop && crop::crop(&mut self.buffers[i], &mut geometry) {
            self.params.delivered.width = geometry.width as u32;
            self.params.delivered.height = geometry.height as u32;
            self.params.delivered.bpl = geometry.bpl;
            self.params.delivered.bytes_sent[i] = geometry.total_bytes();
            self.params.delivered.bytes_tot[i] = geometry.total_bytes();
        }

        if self.settings.sw_despeckle > 0 {
            despeckle::despeckle(
                &mut self.buffers[i],
                &geometry,
                self.settings.sw_despeckle as usize,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Connection, DeviceModel, dpi_index};
    use crate::image::ColorInterlace;
    use crate::transport::mock::MockBlock;
    use crate::transport::{BlockResponse, BlockTransport, TransportError};
    use std::sync::{Arc, Mutex};

    /// Opcode-driven fake device for exercising whole session flows.
    #[derive(Default)]
    struct FakeState {
        /// Opcodes of every control block, in order.
        opcodes: Vec<u8>,
        /// SCAN payload types (window ids or lamp bytes).
        scan_types: Vec<u8>,
        /// Bytes served per SCAN before reporting end of data; the
        /// budget resets on every SCAN command.
        scan_budget: Option<usize>,
        served: usize,
        /// Value every image byte carries.
        fill: u8,
        /// Page counter reported by the panel block.
        counter: u32,
    }

    #[derive(Clone)]
    struct FakeScanner {
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeScanner {
        fn new(fill: u8) -> Self {
            Self {
                state: Arc::new(Mutex::new(FakeState { fill, ..Default::default() })),
            }
        }

        fn with_budget(fill: u8, budget: usize) -> Self {
            let fake = Self::new(fill);
            fake.state.lock().unwrap().scan_budget = Some(budget);
            fake
        }

        fn opcode_count(&self, op: u8) -> usize {
            self.state.lock().unwrap().opcodes.iter().filter(|&&o| o == op).count()
        }

        fn set_counter(&self, c: u32) {
            self.state.lock().unwrap().counter = c;
        }
    }

    impl BlockTransport for FakeScanner {
        fn transact(
            &mut self,
            cdb: &[u8],
            data_out: &[u8],
            data_in_len: usize,
        ) -> Result<BlockResponse, TransportError> {
            let mut st = self.state.lock().unwrap();
            st.opcodes.push(cdb[0]);

            match cdb[0] {
                cdb::SCAN => {
                    st.scan_types.push(data_out.first().copied().unwrap_or(0));
                    st.served = 0;
                    Ok(BlockResponse::default())
                }
                cdb::READ => match cdb[2] {
                    cdb::DT_IMAGE => {
                        let budget = st.scan_budget.unwrap_or(usize::MAX);
                        let left = budget.saturating_sub(st.served);
                        let n = data_in_len.min(left);
                        st.served += n;
                        let mut resp =
                            BlockResponse { data: vec![st.fill; n], sense: None };
                        if n < data_in_len {
                            // short read: ILI sense with the residual
                            let mut sense = vec![0u8; 0x0e];
                            sense[0x02] = 1 << 5;
                            sense[0x03..0x07]
                                .copy_from_slice(&((data_in_len - n) as u32).to_be_bytes());
                            resp.sense = Some(sense);
                        }
                        Ok(resp)
                    }
                    cdb::DT_PANEL => {
                        let mut data = vec![0u8; cdb::PANEL_LEN];
                        data[0x04..0x08].copy_from_slice(&st.counter.to_be_bytes());
                        Ok(BlockResponse { data, sense: None })
                    }
                    cdb::DT_SENSORS => {
                        Ok(BlockResponse { data: vec![0x09], sense: None })
                    }
                    cdb::DT_FINE_OFFSET | cdb::DT_FINE_GAIN => {
                        Ok(BlockResponse { data: vec![8; data_in_len], sense: None })
                    }
                    _ => Ok(BlockResponse::default()),
                },
                _ => Ok(BlockResponse::default()),
            }
        }
    }

    fn simple_model() -> DeviceModel {
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
        m.can_color = true;
        m.std_res_x[dpi_index(300)] = true;
        m.std_res_y = m.std_res_x;
        m.buffer_size = 65536;
        m
    }

    fn session_with(model: DeviceModel, fake: FakeScanner) -> Session {
        let device = Device { name: "fake".into(), model };
        let channel = Channel::block(Box::new(fake));
        Session::new(device, channel)
    }

    fn small_gray_settings(s: &mut ScanSettings) {
        s.mode = Mode::Gray;
        s.source = Source::AdfFront;
        s.dpi_x = 300;
        s.dpi_y = 300;
        s.tl_x = 0;
        s.tl_y = 0;
        s.br_x = 64 * 1200 / 300; // 64 pixels
        s.br_y = 16 * 1200 / 300; // 16 lines
        s.page_x = s.br_x;
        s.page_y = s.br_y;
    }

    fn drain_side(session: &mut Session) -> Vec<u8> {
        let mut page = Vec::new();
        let mut chunk = vec![0u8; 512];
        loop {
            match session.read(&mut chunk).unwrap() {
                ReadOutcome::Data(n) => page.extend_from_slice(&chunk[..n]),
                ReadOutcome::EndOfSide => break,
            }
        }
        page
    }

    #[test]
    fn test_simple_scan_delivers_page() {
        let fake = FakeScanner::new(0x55);
        let mut session = session_with(simple_model(), fake.clone());
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        let page = drain_side(&mut session);

        assert_eq!(page.len(), 64 * 16);
        assert!(page.iter().all(|&b| b == 0x55));

        // window programmed once, one feed + at least the initial eject
        assert_eq!(fake.opcode_count(cdb::SET_WINDOW), 1);
        assert_eq!(fake.opcode_count(cdb::SCAN), 1);
        assert!(fake.opcode_count(cdb::OBJECT_POSITION) >= 2);
    }

    #[test]
    fn test_start_before_side_done_is_invalid() {
        let fake = FakeScanner::new(0x55);
        let mut session = session_with(simple_model(), fake);
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        let mut chunk = vec![0u8; 64];
        session.read(&mut chunk).unwrap();

        // second start before EndOfSide is a programming error
        assert!(matches!(session.start(), Err(ScanError::Invalid(_))));
    }

    #[test]
    fn test_end_of_scan_padding() {
        // device stops after 8 of 16 lines; the driver must replicate
        // the final line and still deliver the promised total
        let fake = FakeScanner::with_budget(0x77, 64 * 8);
        let mut session = session_with(simple_model(), fake);
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        let page = drain_side(&mut session);

        assert_eq!(page.len(), 64 * 16);
        assert!(page.iter().all(|&b| b == 0x77));

        // counters were forced consistent
        assert_eq!(
            session.params.scanner.bytes_sent[0],
            session.params.scanner.bytes_tot[0]
        );
        assert!(session.params.delivered.eof[0]);
    }

    #[test]
    fn test_cancel_between_reads() {
        let fake = FakeScanner::new(0x55);
        let mut session = session_with(simple_model(), fake.clone());
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        session.cancel();

        let mut chunk = vec![0u8; 64];
        assert_eq!(session.read(&mut chunk).unwrap_err(), ScanError::Cancelled);
        assert_eq!(session.phase(), SessionPhase::Cancelled);
        assert_eq!(fake.opcode_count(cdb::CANCEL), 1);

        // next read without start is refused
        assert_eq!(session.read(&mut chunk).unwrap_err(), ScanError::Cancelled);
    }

    fn ccal_model() -> DeviceModel {
        let mut m = simple_model();
        m.need_ccal = true;
        m.ccal_version = 0;
        m.duplex_interlace = crate::image::DuplexInterlace::ByteAlternating;
        m
    }

    #[test]
    fn test_coarse_calibration_runs_once_per_key() {
        let fake = FakeScanner::new(0x40);
        let mut session = session_with(ccal_model(), fake.clone());
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        drain_side(&mut session);
        // three cal passes write the afe, plus the final write
        let afe_writes = fake.opcode_count(cdb::COARSE_CAL);
        assert_eq!(afe_writes, 4);
        // three calibration scans plus the real one
        assert_eq!(fake.opcode_count(cdb::SCAN), 4);

        // new batch, unchanged settings: calibration must be skipped
        session.cancel();
        session.start().unwrap();
        drain_side(&mut session);
        assert_eq!(fake.opcode_count(cdb::COARSE_CAL), afe_writes);
        assert_eq!(fake.opcode_count(cdb::SCAN), 5);
    }

    #[test]
    fn test_calibration_reruns_on_resolution_change() {
        let mut model = ccal_model();
        model.std_res_x[dpi_index(600)] = true;
        model.std_res_y = model.std_res_x;
        let fake = FakeScanner::new(0x40);
        let mut session = session_with(model, fake.clone());
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        drain_side(&mut session);
        let first = fake.opcode_count(cdb::COARSE_CAL);

        session.cancel();
        session
            .update_settings(|s| {
                s.dpi_x = 600;
                s.dpi_y = 600;
            })
            .unwrap();
        session.start().unwrap();
        drain_side(&mut session);
        assert_eq!(fake.opcode_count(cdb::COARSE_CAL), first * 2);
    }

    #[test]
    fn test_calibration_scan_types() {
        let fake = FakeScanner::new(0x40);
        let mut session = session_with(ccal_model(), fake.clone());
        session.update_settings(small_gray_settings).unwrap();
        session.start().unwrap();

        let st = fake.state.lock().unwrap();
        // lamp off, lamp on, lamp on, then the real scan
        assert_eq!(st.scan_types, vec![0xff, 0xfe, 0xfe, 0x00]);
    }

    #[test]
    fn test_duplex_interleaved_scan() {
        let mut model = simple_model();
        model.duplex_interlace = crate::image::DuplexInterlace::ByteAlternating;
        let fake = FakeScanner::new(0x33);
        let mut session = session_with(model, fake);
        session
            .update_settings(|s| {
                small_gray_settings(s);
                s.source = Source::AdfDuplex;
            })
            .unwrap();

        session.start().unwrap();
        let front = drain_side(&mut session);
        assert_eq!(front.len(), 64 * 16);

        // back side was buffered along with the front
        session.start().unwrap();
        assert_eq!(session.side(), Side::Back);
        let back = drain_side(&mut session);
        assert_eq!(back.len(), 64 * 16);
        assert!(back.iter().all(|&b| b == 0x33));
    }

    #[test]
    fn test_buffered_continuation_checks_counter() {
        let mut model = simple_model();
        model.always_op = false;
        let fake = FakeScanner::with_budget(0x55, 64 * 16);
        fake.set_counter(1);
        let mut session = session_with(model, fake.clone());
        session
            .update_settings(|s| {
                small_gray_settings(s);
                s.buffer_mode = true;
            })
            .unwrap();

        session.start().unwrap();
        drain_side(&mut session);

        // counter still equals the pages we saw: no more documents
        let err = session.start().unwrap_err();
        assert_eq!(err, ScanError::NoDocs);
    }

    #[test]
    fn test_dumb_scanner_path_restores_user_geometry() {
        // fixed-width device scans the whole 8.5" sensor; the caller
        // asked for 64 pixels and must get exactly that
        let mut model = simple_model();
        model.fixed_width = true;
        let fake = FakeScanner::new(0x99);
        let mut session = session_with(model, fake);
        session.update_settings(small_gray_settings).unwrap();

        session.start().unwrap();
        let page = drain_side(&mut session);
        assert_eq!(page.len(), 64 * 16);
        assert!(page.iter().all(|&b| b == 0x99));
    }

    #[test]
    fn test_software_crop_shrinks_delivery() {
        let fake = FakeScanner::with_budget(0xee, 128 * 64);
        let mut session = session_with(simple_model(), fake);
        session
            .update_settings(|s| {
                small_gray_settings(s);
                // 128x64 page with crop enabled
                s.br_x = 128 * 1200 / 300;
                s.br_y = 64 * 1200 / 300;
                s.page_x = s.br_x;
                s.page_y = s.br_y;
                s.sw_crop = true;
            })
            .unwrap();

        // the fake serves uniform background, so no crop rectangle is
        // found and the full page must come through
        session.start().unwrap();
        let page = drain_side(&mut session);
        assert_eq!(page.len(), 128 * 64);
    }

    #[test]
    fn test_color_interlace_applied_per_line() {
        let mut model = simple_model();
        model.color_interlace = [ColorInterlace::Bgr; 2];
        // serve a repeating b,g,r pattern so descrambled output is rgb
        #[derive(Clone)]
        struct PatternScanner {
            inner: FakeScanner,
        }
        impl BlockTransport for PatternScanner {
            fn transact(
                &mut self,
                cdb_bytes: &[u8],
                data_out: &[u8],
                data_in_len: usize,
            ) -> Result<BlockResponse, TransportError> {
                if cdb_bytes[0] == cdb::READ && cdb_bytes[2] == cdb::DT_IMAGE {
                    let mut st = self.inner.state.lock().unwrap();
                    st.opcodes.push(cdb_bytes[0]);
                    let data: Vec<u8> = (0..data_in_len)
                        .map(|i| match i % 3 {
                            0 => 3, // blue first on the wire
                            1 => 2,
                            _ => 1,
                        })
                        .collect();
                    return Ok(BlockResponse { data, sense: None });
                }
                self.inner.transact(cdb_bytes, data_out, data_in_len)
            }
        }

        let fake = PatternScanner { inner: FakeScanner::new(0) };
        let device = Device { name: "fake".into(), model };
        let mut session = Session::new(device, Channel::block(Box::new(fake)));
        session
            .update_settings(|s| {
                small_gray_settings(s);
                s.mode = Mode::Color;
            })
            .unwrap();

        session.start().unwrap();
        let page = drain_side(&mut session);
        assert_eq!(page.len(), 64 * 16 * 3);
        // every pixel came out r,g,b
        for px in page.chunks(3) {
            assert_eq!(px, &[1, 2, 3]);
        }
    }

    #[test]
    fn test_read_before_start_is_cancelled() {
        let fake = FakeScanner::new(0x55);
        let mut session = session_with(simple_model(), fake);
        let mut chunk = vec![0u8; 16];
        assert_eq!(session.read(&mut chunk).unwrap_err(), ScanError::Cancelled);
    }

    #[test]
    fn test_mock_block_scriptable_for_panel() {
        // panel read path against the plain scripted mock
        let mock = MockBlock::new();
        let mut data = vec![0u8; cdb::PANEL_LEN];
        data[0] = 0b1000_0000;
        data[0x04..0x08].copy_from_slice(&7u32.to_be_bytes());
        mock.queue_data(data);

        let device = Device { name: "mock".into(), model: simple_model() };
        let mut session = Session::new(device, Channel::block(Box::new(mock)));
        let panel = session.read_panel().unwrap();
        assert!(panel.start_pressed);
        assert!(!panel.stop_pressed);
        assert_eq!(panel.counter, 7);
    }
}
