//! Per-session transfer state.

use super::Target;
use crate::error::Error;

/// State of the one transfer a session may have in flight. Created empty
/// when a session starts, reset on terminal commands and protocol
/// errors, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferContext {
    pub in_progress: bool,
    pub target: Option<Target>,
    pub last_block: u16,
    pub expected_total: usize,
    pub crc_received: bool,
}

impl TransferContext {
    pub const fn new() -> TransferContext {
        TransferContext {
            in_progress: false,
            target: None,
            last_block: 0,
            expected_total: 0,
            crc_received: false,
        }
    }

    /// Ends the current transfer, keeping the addressed target around
    /// for the caller to inspect.
    pub fn finish(&mut self) {
        self.in_progress = false;
        self.last_block = 0;
        self.crc_received = false;
    }

    /// Full reset back to the empty state.
    pub fn clear(&mut self) {
        *self = TransferContext::new();
    }

    /// Accepts a write request. Rejected without any state change while
    /// a transfer is running.
    pub fn open_write(&mut self, target: Target) -> Result<(), Error> {
        if self.in_progress {
            return Err(Error::TransferInProgress);
        }
        self.target = Some(target);
        self.last_block = 0;
        self.crc_received = false;
        self.in_progress = true;
        Ok(())
    }

    /// Accepts a read request for `length` bytes of `target`.
    pub fn open_read(&mut self, target: Target, length: u32) -> Result<(), Error> {
        if self.in_progress {
            return Err(Error::TransferInProgress);
        }
        self.target = Some(target);
        self.expected_total = length as usize;
        self.last_block = 0;
        self.crc_received = false;
        Ok(())
    }

    /// Validates an incoming data block. Blocks must arrive in strict
    /// sequence; a gap, duplicate or reordering is a hard error and the
    /// context stays `in_progress` so the caller can tell the transfer
    /// died mid-flight.
    pub fn accept_data(&mut self, block: u16) -> Result<(), Error> {
        if !self.in_progress {
            return Err(Error::NoTransferInProgress);
        }
        let expected = self.last_block.wrapping_add(1);
        if block != expected {
            return Err(Error::Sequence { expected, received: block });
        }
        self.last_block = block;
        Ok(())
    }

    /// Validates an acknowledgment against the last block sent.
    pub fn accept_ack(&mut self, block: u16) -> Result<(), Error> {
        if !self.in_progress {
            return Err(Error::NoTransferInProgress);
        }
        if block != self.last_block {
            return Err(Error::Sequence { expected: self.last_block, received: block });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn second_write_request_is_rejected_without_mutation() {
        let mut ctx = TransferContext::new();
        ctx.open_write(Target::AppBank1).unwrap();
        ctx.accept_data(1).unwrap();

        let before = ctx;
        assert_eq!(ctx.open_write(Target::AppBank0), Err(Error::TransferInProgress));
        assert_eq!(ctx.open_read(Target::AppBank0, 64), Err(Error::TransferInProgress));
        assert_eq!(ctx, before);
    }

    #[test]
    fn data_blocks_must_be_strictly_sequential() {
        let mut ctx = TransferContext::new();
        ctx.open_write(Target::AppBank0).unwrap();

        ctx.accept_data(1).unwrap();
        ctx.accept_data(2).unwrap();
        // A gap is rejected and the context stays in progress.
        assert_eq!(ctx.accept_data(4), Err(Error::Sequence { expected: 3, received: 4 }));
        assert!(ctx.in_progress);
        // So is a duplicate of the last block.
        assert_eq!(ctx.accept_data(2), Err(Error::Sequence { expected: 3, received: 2 }));
        assert_eq!(ctx.last_block, 2);
    }

    #[test]
    fn data_outside_a_transfer_is_rejected() {
        let mut ctx = TransferContext::new();
        assert_eq!(ctx.accept_data(1), Err(Error::NoTransferInProgress));
        assert_eq!(ctx.accept_ack(0), Err(Error::NoTransferInProgress));
    }

    #[test]
    fn acks_must_match_the_block_in_flight() {
        let mut ctx = TransferContext::new();
        ctx.open_write(Target::SpiBank0).unwrap();
        ctx.last_block = 7;

        ctx.accept_ack(7).unwrap();
        assert_eq!(ctx.accept_ack(6), Err(Error::Sequence { expected: 7, received: 6 }));
        assert_eq!(ctx.accept_ack(8), Err(Error::Sequence { expected: 7, received: 8 }));
    }

    #[test]
    fn finish_keeps_the_target_for_the_caller() {
        let mut ctx = TransferContext::new();
        ctx.open_write(Target::SpiBank1).unwrap();
        ctx.accept_data(1).unwrap();
        ctx.finish();

        assert!(!ctx.in_progress);
        assert_eq!(ctx.target, Some(Target::SpiBank1));
        assert_eq!(ctx.last_block, 0);

        ctx.clear();
        assert_eq!(ctx, TransferContext::new());
    }
}
