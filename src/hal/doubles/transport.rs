use super::error::FakeTransportError;
use crate::hal::transport::TransportDriver;
use std::collections::VecDeque;

/// Scripted transport: tests queue the frames the peer "sends" and
/// inspect the frames written in response afterwards. An empty queued
/// frame models the spurious zero-length read serial hardware sometimes
/// produces.
#[derive(Default)]
pub struct FakeTransport {
    incoming: VecDeque<Vec<u8>>,
    outgoing: Vec<Vec<u8>>,
}

impl FakeTransport {
    pub fn new() -> FakeTransport {
        FakeTransport::default()
    }

    pub fn push_frame(&mut self, frame: &[u8]) {
        self.incoming.push_back(frame.to_vec());
    }

    /// Queue a spurious empty read.
    pub fn push_empty(&mut self) {
        self.incoming.push_back(Vec::new());
    }

    /// Frames written by the code under test, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.outgoing
    }
}

impl TransportDriver for FakeTransport {
    type Error = FakeTransportError;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error> {
        self.outgoing.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let frame = self.incoming.pop_front().ok_or(FakeTransportError("out of scripted frames"))?;
        if frame.len() > buffer.len() {
            return Err(FakeTransportError("scripted frame larger than read buffer"));
        }
        buffer[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    fn close(&mut self) {}
}
