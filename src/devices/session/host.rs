//! Host-tool side of the protocol: pushing images to the device and
//! pulling regions back.

use super::read_frame;
use crate::devices::partitions::{BootContext, PersistedContext};
use crate::devices::protocol::{
    self, Command, ErrorCode, Packet, Target, TransferContext, COMMAND_SIZE, DATA_SIZE,
    PACKET_SIZE,
};
use crate::devices::traits::Transport;
use crate::error::Error;

/// Sender-side session: what the flash tool runs against a device in
/// update mode. Strictly synchronous — one outstanding block, each
/// acknowledged before the next goes out.
pub struct HostSession<'a, T: Transport> {
    transport: &'a mut T,
    context: TransferContext,
}

impl<'a, T: Transport> HostSession<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        HostSession { transport, context: TransferContext::new() }
    }

    /// Pushes `image` into the addressed bank: write request, data
    /// blocks numbered from one, the image CRC32, and the terminating
    /// command for the bank category.
    pub fn transfer_binary(&mut self, target: Target, image: &[u8], crc: u32) -> Result<(), Error> {
        self.context.clear();

        self.send(Packet::WriteRequest { target })?;
        self.expect_any_ack()?;
        self.context.open_write(target)?;
        info!("transferring {} bytes", image.len());

        let mut block: u16 = 0;
        for chunk in image.chunks(DATA_SIZE) {
            block = block.wrapping_add(1);
            self.send(Packet::Data { block, payload: chunk })?;
            self.context.last_block = block;
            self.await_ack()?;
        }

        self.send(Packet::Command(Command::Crc(crc)))?;
        // The device acks the CRC command; the read doubles as
        // synchronization before the terminating command.
        self.expect_any_ack()?;

        let end = if target.is_spi() { Command::SpiEnd } else { Command::End };
        self.send(Packet::Command(end))?;
        self.context.clear();
        info!("transfer done");
        Ok(())
    }

    /// Pulls `length` bytes of the addressed bank into `out`, acking
    /// each block, and returns how many bytes arrived before the
    /// device's terminating command.
    pub fn read_binary(
        &mut self,
        target: Target,
        length: u32,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        self.context.clear();
        self.context.open_read(target, length)?;
        self.send(Packet::ReadRequest { length, target })?;
        self.context.in_progress = true;

        let mut received = 0usize;
        let mut expected_block: u16 = 0;
        loop {
            let mut buffer = [0u8; PACKET_SIZE];
            let frame = read_frame(&mut *self.transport, &mut buffer)?;
            match protocol::parse(&buffer[..frame])? {
                Packet::Data { block, payload } => {
                    if block != expected_block {
                        self.send_error(ErrorCode::Sequence, "unexpected block number")?;
                        return Err(Error::Sequence { expected: expected_block, received: block });
                    }
                    if received + payload.len() > out.len() {
                        return Err(Error::Framing("reply larger than read buffer"));
                    }
                    out[received..received + payload.len()].copy_from_slice(payload);
                    received += payload.len();
                    self.context.last_block = block;
                    self.send(Packet::Ack { block })?;
                    expected_block = expected_block.wrapping_add(1);
                }
                Packet::Command(Command::End) | Packet::Command(Command::SpiEnd) => {
                    self.context.clear();
                    info!("read finished after {} bytes", received);
                    return Ok(received);
                }
                Packet::Error { code, .. } => {
                    self.context.clear();
                    return Err(Error::Peer(code as u16));
                }
                _ => {
                    self.send_error(ErrorCode::Sequence, "expected data block")?;
                    return Err(Error::UnexpectedPacket);
                }
            }
        }
    }

    /// Asks the bootloader to jump to the selected application bank.
    pub fn force_boot(&mut self) -> Result<(), Error> {
        self.send_command(Command::Boot)
    }

    /// Requests the persisted application boot context from the device.
    pub fn request_boot_info(&mut self) -> Result<BootContext, Error> {
        self.send_command(Command::BootInfo)?;

        let mut buffer = [0u8; PACKET_SIZE];
        let frame = read_frame(&mut *self.transport, &mut buffer)?;
        if frame < COMMAND_SIZE + BootContext::SIZE {
            return Err(Error::Framing("short boot info reply"));
        }
        match protocol::parse(&buffer[..COMMAND_SIZE])? {
            Packet::Command(Command::BootInfo) => {
                Ok(BootContext::decode(&buffer[COMMAND_SIZE..COMMAND_SIZE + BootContext::SIZE]))
            }
            _ => Err(Error::UnexpectedPacket),
        }
    }

    /// Sends a bare command packet (swap, reset, power, erase, ...).
    pub fn send_command(&mut self, command: Command) -> Result<(), Error> {
        self.send(Packet::Command(command))
    }

    fn send(&mut self, packet: Packet) -> Result<(), Error> {
        let mut buffer = [0u8; PACKET_SIZE];
        let length = packet.encode(&mut buffer);
        self.transport.write(&buffer[..length])?;
        Ok(())
    }

    fn send_error(&mut self, code: ErrorCode, message: &str) -> Result<(), Error> {
        self.send(Packet::Error { code, message: message.as_bytes() })
    }

    /// Waits for the matching ack of the block in flight. An error
    /// packet or any other kind tears the transfer down, after telling
    /// the device why.
    fn await_ack(&mut self) -> Result<(), Error> {
        let mut buffer = [0u8; PACKET_SIZE];
        let frame = read_frame(&mut *self.transport, &mut buffer)?;
        match protocol::parse(&buffer[..frame])? {
            Packet::Ack { block } => self.context.accept_ack(block),
            Packet::Error { code, .. } => Err(Error::Peer(code as u16)),
            _ => {
                self.send_error(ErrorCode::Sequence, "packet out of sequence")?;
                Err(Error::UnexpectedPacket)
            }
        }
    }

    /// Accepts any ack regardless of block number, used where the
    /// protocol only synchronizes (after a write request or the CRC
    /// command).
    fn expect_any_ack(&mut self) -> Result<(), Error> {
        let mut buffer = [0u8; PACKET_SIZE];
        let frame = read_frame(&mut *self.transport, &mut buffer)?;
        match protocol::parse(&buffer[..frame])? {
            Packet::Ack { .. } => Ok(()),
            Packet::Error { code, .. } => Err(Error::Peer(code as u16)),
            _ => Err(Error::UnexpectedPacket),
        }
    }
}
