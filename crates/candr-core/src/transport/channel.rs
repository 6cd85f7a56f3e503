//! Command execution over either wire variant.
//!
//! A `Channel` takes one `Command` (control block plus optional data
//! phases), runs it against the transport, and reconciles the result
//! with the device's status reporting. On the packetized (USB) wire
//! every exchange is framed: command envelope, optional extra-status
//! trailer, optional outbound envelope, optional inbound data, and a
//! status trailer. Failed exchanges run the recovery sequence exactly
//! once: clear the endpoint, REQUEST SENSE, translate.

use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::traits::{BlockTransport, BulkTransport};
use crate::error::ScanError;
use crate::protocol::bytes::get_n;
use crate::protocol::cdb::{
    self, USB_COMMAND_LEN, USB_COMMAND_TIME_MS, USB_DATA_TIME_MS, USB_EXTRA_STATUS_LEN,
    USB_HEADER_LEN, USB_PROBE_DIVISOR, USB_STATUS_LEN, USB_STATUS_TIME_MS,
};
use crate::protocol::sense::{self, SenseVerdict};

/// Envelope phase tags.
const PHASE_COMMAND: u8 = 1;
const PHASE_DATA_OUT: u8 = 2;
const TAG_COMMAND: u8 = 0x90;
const TAG_DATA_OUT: u8 = 0xb0;

/// One command to execute: control block, optional outbound payload,
/// expected inbound length.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub cdb: &'a [u8],
    pub data_out: Option<&'a [u8]>,
    pub data_in_len: usize,
}

impl<'a> Command<'a> {
    pub fn simple(cdb: &'a [u8]) -> Self {
        Self { cdb, data_out: None, data_in_len: 0 }
    }

    pub fn with_out(cdb: &'a [u8], out: &'a [u8]) -> Self {
        Self { cdb, data_out: Some(out), data_in_len: 0 }
    }

    pub fn with_in(cdb: &'a [u8], data_in_len: usize) -> Self {
        Self { cdb, data_out: None, data_in_len }
    }
}

/// Completed exchange: inbound bytes already trimmed to the actual
/// transfer, plus whether the device signalled end of data.
#[derive(Debug, Default)]
pub struct Response {
    pub data: Vec<u8>,
    pub end_of_data: bool,
}

/// Framing knobs for the packetized wire, from per-device config.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramingOptions {
    /// Device prefixes inbound data and status with a 12-byte header.
    pub padded_read: bool,
    /// Device sends an extra status trailer after the command phase.
    pub extra_status: bool,
}

enum Wire {
    Block(Box<dyn BlockTransport>),
    Packetized {
        bulk: Box<dyn BulkTransport>,
        framing: FramingOptions,
    },
}

/// Status-trailer outcome before it is folded into a `Response`.
enum StatusOutcome {
    Good,
    ShortRead(u32),
}

pub struct Channel {
    wire: Wire,
}

impl Channel {
    pub fn block(transport: Box<dyn BlockTransport>) -> Self {
        Self { wire: Wire::Block(transport) }
    }

    pub fn packetized(bulk: Box<dyn BulkTransport>, framing: FramingOptions) -> Self {
        Self { wire: Wire::Packetized { bulk, framing } }
    }

    /// Execute one command with normal timeouts.
    pub fn execute(&mut self, cmd: Command<'_>) -> Result<Response, ScanError> {
        self.execute_inner(cmd, true, false)
    }

    /// Execute one command with probe (1/60) timeouts. Used only for
    /// the initial liveness check.
    pub fn probe(&mut self, cmd: Command<'_>) -> Result<Response, ScanError> {
        self.execute_inner(cmd, true, true)
    }

    /// Liveness probe: TEST UNIT READY, retried up to three times on
    /// a busy or sluggish device before surfacing the error.
    pub fn wait_ready(&mut self) -> Result<(), ScanError> {
        let cdb = cdb::test_unit_ready();
        let mut last = Ok(());
        for attempt in 0..3 {
            match self.probe(Command::simple(&cdb)) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "device not ready, retrying");
                    last = Err(e);
                }
            }
        }
        last
    }

    fn execute_inner(
        &mut self,
        cmd: Command<'_>,
        run_sense: bool,
        probe: bool,
    ) -> Result<Response, ScanError> {
        match &mut self.wire {
            Wire::Block(t) => {
                trace!(cdb = ?cmd.cdb, in_len = cmd.data_in_len, "block transact");
                let resp = t.transact(cmd.cdb, cmd.data_out.unwrap_or(&[]), cmd.data_in_len)?;
                match resp.sense {
                    None => Ok(Response { data: resp.data, end_of_data: false }),
                    Some(sense_data) => match sense::decode(&sense_data) {
                        SenseVerdict::Good => {
                            Ok(Response { data: resp.data, end_of_data: false })
                        }
                        SenseVerdict::ShortRead(residual) => {
                            // trim the inbound payload to the bytes the
                            // device actually delivered
                            let mut data = resp.data;
                            let actual = cmd.data_in_len.saturating_sub(residual as usize);
                            data.truncate(actual);
                            debug!(residual, actual, "short read");
                            Ok(Response { data, end_of_data: true })
                        }
                        SenseVerdict::Fail(e) => Err(e),
                    },
                }
            }
            Wire::Packetized { bulk, framing } => {
                let framing = *framing;
                Self::usb_exchange(bulk.as_mut(), framing, cmd, run_sense, probe)
            }
        }
    }

    fn usb_exchange(
        bulk: &mut dyn BulkTransport,
        framing: FramingOptions,
        cmd: Command<'_>,
        run_sense: bool,
        probe: bool,
    ) -> Result<Response, ScanError> {
        let cmd_timeout = phase_timeout(USB_COMMAND_TIME_MS, probe);
        let data_timeout = phase_timeout(USB_DATA_TIME_MS, probe);

        // command phase: envelope + padded control block
        let cmd_len = USB_HEADER_LEN + USB_COMMAND_LEN;
        let mut envelope = vec![0u8; cmd_len];
        envelope[3] = (cmd_len - 4) as u8;
        envelope[5] = PHASE_COMMAND;
        envelope[6] = TAG_COMMAND;
        envelope[USB_HEADER_LEN..USB_HEADER_LEN + cmd.cdb.len()].copy_from_slice(cmd.cdb);

        trace!(opcode = format!("{:#04x}", cmd.cdb[0]), len = cmd_len, "cmd phase");
        let written = bulk.write_bulk(&envelope, cmd_timeout)?;
        if written != cmd_len {
            return Err(ScanError::Io(format!(
                "command phase wrote {written}/{cmd_len} bytes"
            )));
        }

        // extra status trailer, used by few devices; carries a
        // residual hint for the data phase
        let mut extra_len: u32 = 0;
        if framing.extra_status {
            let (outcome, extra) = Self::usb_status(bulk, framing, run_sense, probe)?;
            extra_len = extra;
            if let StatusOutcome::ShortRead(_) = outcome {
                debug!("extra status reported short, continuing");
            }
        }

        // outbound data phase
        if let Some(out) = cmd.data_out {
            let out_len = USB_HEADER_LEN + out.len();
            let mut envelope = vec![0u8; out_len];
            envelope[3] = (out_len - 4) as u8;
            envelope[5] = PHASE_DATA_OUT;
            envelope[6] = TAG_DATA_OUT;
            envelope[USB_HEADER_LEN..].copy_from_slice(out);

            trace!(len = out_len, "out phase");
            let written = bulk.write_bulk(&envelope, data_timeout)?;
            if written != out_len {
                return Err(ScanError::Io(format!(
                    "data-out phase wrote {written}/{out_len} bytes"
                )));
            }
        }

        // inbound data phase
        let mut in_buffer: Option<Vec<u8>> = None;
        let in_offset = if framing.padded_read { USB_HEADER_LEN } else { 0 };
        let in_length = in_offset + cmd.data_in_len;
        if cmd.data_in_len > 0 {
            let mut request = in_length;

            // extra status may shrink the request
            if framing.extra_status
                && extra_len != 0
                && cmd.data_in_len > extra_len as usize
            {
                debug!(req = cmd.data_in_len, extra = extra_len, "extra status shrinks read");
                request = in_offset + extra_len as usize;
            }

            trace!(len = request, "in phase");
            let data = bulk.read_bulk(request, data_timeout)?;
            if data.is_empty() {
                debug!("empty data phase, running recovery");
                return match Self::usb_recover(bulk, framing, true, run_sense, probe)? {
                    StatusOutcome::Good => Ok(Response::default()),
                    StatusOutcome::ShortRead(_) => {
                        Ok(Response { data: Vec::new(), end_of_data: true })
                    }
                };
            }
            if data.len() < in_offset {
                return Err(ScanError::Io("read shorter than framing header".into()));
            }
            in_buffer = Some(data);
        }

        // normal status trailer
        let (outcome, _) = Self::usb_status(bulk, framing, run_sense, probe)?;

        let Some(mut data) = in_buffer else {
            return Ok(Response::default());
        };

        // fold the residual into the inbound byte count
        if let StatusOutcome::ShortRead(residual) = outcome {
            let expect = in_length.saturating_sub(residual as usize);
            if data.len() > expect {
                debug!(got = data.len(), expect, "trimming to residual");
                data.truncate(expect);
            }
        }

        let end_of_data = data.len() != in_length;
        data.drain(..in_offset.min(data.len()));
        Ok(Response { data, end_of_data })
    }

    /// Read and check a status trailer, running recovery on anything
    /// other than a clean zero status. Returns the verdict plus the
    /// extra-status residual hint when configured.
    fn usb_status(
        bulk: &mut dyn BulkTransport,
        framing: FramingOptions,
        run_sense: bool,
        probe: bool,
    ) -> Result<(StatusOutcome, u32), ScanError> {
        let timeout = phase_timeout(USB_STATUS_TIME_MS, probe);

        let padding = if framing.padded_read { USB_HEADER_LEN } else { 0 };
        let mut stat_len = padding + USB_STATUS_LEN;
        let stat_offset = stat_len - 1;
        if framing.extra_status {
            stat_len += USB_EXTRA_STATUS_LEN;
        }

        let stat = match bulk.read_bulk(stat_len, timeout) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "status read failed, clearing");
                let outcome = Self::usb_recover(bulk, framing, true, run_sense, probe)?;
                return Ok((outcome, 0));
            }
        };

        if stat.len() != stat_len {
            debug!(got = stat.len(), want = stat_len, "short status, clearing");
            let outcome = Self::usb_recover(bulk, framing, true, run_sense, probe)?;
            return Ok((outcome, 0));
        }

        if stat[stat_offset] != 0 {
            debug!(status = stat[stat_offset], "bad status byte");
            let outcome = Self::usb_recover(bulk, framing, false, run_sense, probe)?;
            return Ok((outcome, 0));
        }

        let extra = if framing.extra_status {
            get_n(&stat, padding + USB_STATUS_LEN, 4)
        } else {
            0
        };

        Ok((StatusOutcome::Good, extra))
    }

    /// One-shot recovery: settle, optionally clear the halted
    /// endpoint, then REQUEST SENSE and translate its result.
    fn usb_recover(
        bulk: &mut dyn BulkTransport,
        framing: FramingOptions,
        clear: bool,
        run_sense: bool,
        probe: bool,
    ) -> Result<StatusOutcome, ScanError> {
        thread::sleep(Duration::from_millis(100));

        if clear {
            debug!("clearing endpoint halt");
            bulk.clear_halt()?;
        }

        if !run_sense {
            return Err(ScanError::Io("status check failed".into()));
        }

        let rs_cdb = cdb::request_sense();
        let rs_cmd = Command::with_in(&rs_cdb, cdb::SENSE_LEN);
        let resp = Self::usb_exchange(bulk, framing, rs_cmd, false, probe)?;
        if resp.end_of_data {
            return Err(ScanError::Io("short REQUEST SENSE response".into()));
        }

        match sense::decode(&resp.data) {
            SenseVerdict::Good => Ok(StatusOutcome::Good),
            SenseVerdict::ShortRead(residual) => Ok(StatusOutcome::ShortRead(residual)),
            SenseVerdict::Fail(e) => Err(e),
        }
    }
}

fn phase_timeout(base_ms: u64, probe: bool) -> Duration {
    if probe {
        Duration::from_millis(base_ms / USB_PROBE_DIVISOR as u64)
    } else {
        Duration::from_millis(base_ms)
    }
}
