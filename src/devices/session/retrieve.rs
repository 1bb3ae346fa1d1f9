//! Device-to-host streaming: serving a read request.

use super::{bank_of, read_frame, Session};
use crate::devices::partitions::PersistedContext;
use crate::devices::protocol::{self, Command, Packet, TransferContext, DATA_SIZE, PACKET_SIZE};
use crate::devices::traits::{Storage, Transport};
use crate::error::Error;

impl<T, SF, SX> Session<'_, T, SF, SX>
where
    T: Transport,
    SF: Storage,
    SX: Storage,
{
    /// Streams the addressed region back to the requester in data
    /// packets numbered from zero, one outstanding block at a time,
    /// then sends the terminating command for the bank category. A
    /// request for zero bytes produces no data packets at all.
    pub(super) fn serve_read(&mut self) -> Result<(), Error> {
        let target = self.context.target.ok_or(Error::NoTransferInProgress)?;
        let bank = bank_of(target);
        self.context.in_progress = true;

        if target.is_spi() {
            self.spi_flash.set_area(self.spi.bank_area(bank));
            stream_region(&mut *self.transport, &mut *self.spi_flash, &mut self.context)?;
            self.spi_flash.flush()?;
        } else {
            self.app_flash.set_area(self.boot.bank_area(bank));
            stream_region(&mut *self.transport, &mut *self.app_flash, &mut self.context)?;
            self.app_flash.flush()?;
        }

        let end = if target.is_spi() { Command::SpiEnd } else { Command::End };
        let mut buffer = [0u8; PACKET_SIZE];
        let length = Packet::Command(end).encode(&mut buffer);
        self.transport.write(&buffer[..length])?;
        info!("served {} bytes back to the host", self.context.expected_total);
        Ok(())
    }
}

fn stream_region<T, S>(
    transport: &mut T,
    storage: &mut S,
    context: &mut TransferContext,
) -> Result<(), Error>
where
    T: Transport,
    S: Storage,
{
    let total = context.expected_total;
    let blocks = total / DATA_SIZE;
    let remainder = total % DATA_SIZE;

    let mut chunk = [0u8; DATA_SIZE];
    let mut frame = [0u8; PACKET_SIZE];

    for block in 0..blocks {
        storage.read((block * DATA_SIZE) as u32, &mut chunk)?;
        let length =
            Packet::Data { block: block as u16, payload: &chunk }.encode(&mut frame);
        transport.write(&frame[..length])?;
        context.last_block = block as u16;
        await_ack(transport, context)?;
    }

    if remainder != 0 {
        storage.read((blocks * DATA_SIZE) as u32, &mut chunk[..remainder])?;
        let length = Packet::Data { block: blocks as u16, payload: &chunk[..remainder] }
            .encode(&mut frame);
        transport.write(&frame[..length])?;
        context.last_block = blocks as u16;
        await_ack(transport, context)?;
    }

    Ok(())
}

fn await_ack<T: Transport>(transport: &mut T, context: &mut TransferContext) -> Result<(), Error> {
    let mut buffer = [0u8; PACKET_SIZE];
    let length = read_frame(transport, &mut buffer)?;
    match protocol::parse(&buffer[..length])? {
        Packet::Ack { block } => context.accept_ack(block),
        Packet::Error { code, .. } => Err(Error::Peer(code as u16)),
        _ => Err(Error::UnexpectedPacket),
    }
}
