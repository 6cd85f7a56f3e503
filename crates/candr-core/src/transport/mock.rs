//! Mock transports for unit testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{BlockResponse, BlockTransport, BulkTransport, TransportError};

#[derive(Default)]
struct BulkState {
    reads: Mutex<VecDeque<Vec<u8>>>,
    writes: Mutex<Vec<Vec<u8>>>,
    read_requests: Mutex<Vec<usize>>,
    halt_clears: Mutex<u32>,
    connected: Mutex<bool>,
}

/// Scripted bulk transport: queued read frames, captured writes.
pub struct MockBulk {
    state: Arc<BulkState>,
}

/// Shared view into a `MockBulk` that outlives the boxed transport.
#[derive(Clone)]
pub struct MockBulkHandle {
    state: Arc<BulkState>,
}

impl MockBulk {
    pub fn new() -> Self {
        let state = Arc::new(BulkState::default());
        *state.connected.lock().unwrap() = true;
        Self { state }
    }

    /// Queue one frame to be returned by the next bulk read.
    pub fn queue_read(&self, frame: Vec<u8>) {
        self.state.reads.lock().unwrap().push_back(frame);
    }

    pub fn handle(&self) -> MockBulkHandle {
        MockBulkHandle { state: Arc::clone(&self.state) }
    }
}

impl Default for MockBulk {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBulkHandle {
    /// All captured bulk writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }

    /// Requested lengths of every bulk read, in order.
    pub fn read_requests(&self) -> Vec<usize> {
        self.state.read_requests.lock().unwrap().clone()
    }

    pub fn halt_clears(&self) -> u32 {
        *self.state.halt_clears.lock().unwrap()
    }

    pub fn queue_read(&self, frame: Vec<u8>) {
        self.state.reads.lock().unwrap().push_back(frame);
    }

    pub fn disconnect(&self) {
        *self.state.connected.lock().unwrap() = false;
    }
}

impl BulkTransport for MockBulk {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !*self.state.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.state.writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read_bulk(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !*self.state.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.state.read_requests.lock().unwrap().push(max_len);
        let mut frame = self
            .state
            .reads
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 })?;
        frame.truncate(max_len);
        Ok(frame)
    }

    fn clear_halt(&mut self) -> Result<(), TransportError> {
        *self.state.halt_clears.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct BlockState {
    responses: Mutex<VecDeque<BlockResponse>>,
    transactions: Mutex<Vec<Vec<u8>>>,
}

/// Scripted block transport: one queued response per transaction,
/// control blocks captured for inspection.
pub struct MockBlock {
    state: Arc<BlockState>,
}

#[derive(Clone)]
pub struct MockBlockHandle {
    state: Arc<BlockState>,
}

impl MockBlock {
    pub fn new() -> Self {
        Self { state: Arc::new(BlockState::default()) }
    }

    pub fn queue(&self, response: BlockResponse) {
        self.state.responses.lock().unwrap().push_back(response);
    }

    pub fn queue_data(&self, data: Vec<u8>) {
        self.queue(BlockResponse { data, sense: None });
    }

    pub fn queue_ok(&self) {
        self.queue(BlockResponse::default());
    }

    pub fn handle(&self) -> MockBlockHandle {
        MockBlockHandle { state: Arc::clone(&self.state) }
    }
}

impl Default for MockBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBlockHandle {
    /// Control blocks of every transaction, in order.
    pub fn cdbs(&self) -> Vec<Vec<u8>> {
        self.state.transactions.lock().unwrap().clone()
    }

    pub fn queue(&self, response: BlockResponse) {
        self.state.responses.lock().unwrap().push_back(response);
    }
}

impl BlockTransport for MockBlock {
    fn transact(
        &mut self,
        cdb: &[u8],
        _data_out: &[u8],
        data_in_len: usize,
    ) -> Result<BlockResponse, TransportError> {
        self.state.transactions.lock().unwrap().push(cdb.to_vec());
        let mut resp = self
            .state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 0 })?;
        resp.data.truncate(data_in_len);
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_queue_and_capture() {
        let mut mock = MockBulk::new();
        let handle = mock.handle();
        mock.queue_read(vec![1, 2, 3]);

        mock.write_bulk(b"hello", Duration::from_secs(1)).unwrap();
        let frame = mock.read_bulk(8, Duration::from_secs(1)).unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
        assert_eq!(handle.writes(), vec![b"hello".to_vec()]);
        assert_eq!(handle.read_requests(), vec![8]);

        // empty queue times out
        assert!(matches!(
            mock.read_bulk(8, Duration::from_secs(1)),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_bulk_disconnect() {
        let mut mock = MockBulk::new();
        let handle = mock.handle();
        handle.disconnect();
        assert!(matches!(
            mock.write_bulk(b"x", Duration::from_secs(1)),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_block_truncates_to_request() {
        let mut mock = MockBlock::new();
        let handle = mock.handle();
        mock.queue_data(vec![9; 64]);

        let resp = mock.transact(&[0x28, 0, 0, 0, 0, 0], &[], 16).unwrap();
        assert_eq!(resp.data.len(), 16);
        assert_eq!(handle.cdbs().len(), 1);
        assert_eq!(handle.cdbs()[0][0], 0x28);
    }
}
