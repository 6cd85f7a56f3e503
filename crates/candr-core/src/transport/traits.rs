//! Wire transport abstraction.
//!
//! The driver does not talk to the bus itself; it drives one of two
//! collaborator traits. `BlockTransport` models a SCSI-like stack
//! where one opaque call moves command, data and status together.
//! `BulkTransport` models raw USB bulk pipes where the driver frames
//! each phase itself. Both have mock implementations for unit tests.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("failed to open device: {0}")]
    OpenFailed(String),

    #[error("failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one block-transport transaction.
#[derive(Debug, Default)]
pub struct BlockResponse {
    /// Bytes actually moved in the data-in phase.
    pub data: Vec<u8>,
    /// Raw sense block when the device reported CHECK CONDITION.
    pub sense: Option<Vec<u8>>,
}

/// SCSI-like transport: one call per complete transaction.
pub trait BlockTransport: Send {
    fn transact(
        &mut self,
        cdb: &[u8],
        data_out: &[u8],
        data_in_len: usize,
    ) -> Result<BlockResponse, TransportError>;
}

/// USB-bulk-like transport: raw pipe reads/writes with per-call
/// timeouts plus endpoint recovery.
pub trait BulkTransport: Send {
    /// Write raw bytes to the OUT endpoint.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the IN endpoint.
    fn read_bulk(&mut self, max_len: usize, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;

    /// Clear a halted endpoint condition.
    fn clear_halt(&mut self) -> Result<(), TransportError>;
}
