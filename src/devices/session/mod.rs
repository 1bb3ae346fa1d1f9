//! Transfer session driver.
//!
//! The device side owns one [`TransferContext`] and drives the storage
//! backends behind the protocol: exactly one session, one outstanding
//! block, send-wait-ack. Side-effecting commands (reset, power, swap)
//! are *signalled* to the surrounding boot loop through [`Outcome`];
//! this driver never touches hardware beyond storage and transport.

mod retrieve;
pub mod host;

pub use host::HostSession;

use crate::devices::partitions::{ActiveBank, BankIndex, BootContext, PersistedContext, SpiContext};
use crate::devices::protocol::{self, Command, Packet, Target, TransferContext, PACKET_SIZE};
use crate::devices::traits::{Storage, Transport};
use crate::error::Error;

/// What a finished session asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A verified image landed in an application bank; the descriptor
    /// was updated in memory and must be persisted.
    UpdateBootContext(Target),
    /// Same, for an auxiliary bitstream bank.
    UpdateSpiContext(Target),
    /// A terminal command to act on (boot, reset, swap, power, ...).
    Command(Command),
}

/// Device-side session driver. Borrows the transport, one storage
/// backend per flash device, and the in-memory descriptor tables whose
/// addressed entry it updates on a successful transfer.
pub struct Session<'a, T, SF, SX>
where
    T: Transport,
    SF: Storage,
    SX: Storage,
{
    transport: &'a mut T,
    app_flash: &'a mut SF,
    spi_flash: &'a mut SX,
    boot: &'a mut BootContext,
    spi: &'a mut SpiContext,
    context: TransferContext,
}

impl<'a, T, SF, SX> Session<'a, T, SF, SX>
where
    T: Transport,
    SF: Storage,
    SX: Storage,
{
    pub fn new(
        transport: &'a mut T,
        app_flash: &'a mut SF,
        spi_flash: &'a mut SX,
        boot: &'a mut BootContext,
        spi: &'a mut SpiContext,
    ) -> Self {
        Session { transport, app_flash, spi_flash, boot, spi, context: TransferContext::new() }
    }

    /// The transfer state, for callers that need to tell a cleanly
    /// ended session from one that died mid-transfer.
    pub fn transfer_context(&self) -> &TransferContext {
        &self.context
    }

    /// Runs one session to its terminal packet: reads frames, dispatches
    /// by kind, and returns the outcome the caller must act on.
    ///
    /// Protocol errors are not retried here; the transfer ends and the
    /// host restarts it from scratch. A sequence violation leaves the
    /// context `in_progress` so the caller can see the wreck.
    pub fn run(&mut self) -> Result<Outcome, Error> {
        self.context.clear();
        info!("update session started");

        loop {
            let mut buffer = [0u8; PACKET_SIZE];
            let length = read_frame(&mut *self.transport, &mut buffer)?;
            let packet = protocol::parse(&buffer[..length])?;

            match packet {
                Packet::ReadRequest { length, target } => {
                    info!("read request for {} bytes", length);
                    self.context.open_read(target, length)?;
                    self.serve_read()?;
                    self.context.finish();
                }
                Packet::WriteRequest { target } => {
                    self.context.open_write(target)?;
                    if let Err(error) = self.prepare_bank(target) {
                        self.context.finish();
                        return Err(error);
                    }
                    self.send_ack()?;
                }
                Packet::Data { block, payload } => {
                    self.context.accept_data(block)?;
                    self.write_block(payload)?;
                    self.send_ack()?;
                }
                Packet::Ack { block } => {
                    self.context.accept_ack(block)?;
                }
                Packet::Error { code, message } => {
                    error!("peer reported error {} ({} byte message)", code as u16, message.len());
                    self.context.finish();
                    return Err(Error::Peer(code as u16));
                }
                Packet::Command(Command::Crc(crc)) => {
                    let outcome = match self.finalize(crc) {
                        Ok(outcome) => outcome,
                        Err(error) => {
                            self.context.finish();
                            return Err(error);
                        }
                    };
                    self.context.finish();
                    return Ok(outcome);
                }
                Packet::Command(command) => {
                    debug!("terminal command {}", command.code());
                    self.context.finish();
                    return Ok(Outcome::Command(command));
                }
                Packet::Debug { .. } => {
                    self.context.finish();
                    return Err(Error::UnexpectedPacket);
                }
            }
        }
    }

    /// Encodes the application boot context behind a `BootInfo` command
    /// header and sends it to the host. Called by the boot loop when a
    /// session returns `Outcome::Command(Command::BootInfo)`.
    pub fn send_boot_info(&mut self) -> Result<(), Error> {
        let mut buffer = [0u8; PACKET_SIZE];
        let header = Packet::Command(Command::BootInfo).encode(&mut buffer);
        self.boot.encode(&mut buffer[header..header + BootContext::SIZE]);
        self.transport.write(&buffer[..header + BootContext::SIZE])?;
        Ok(())
    }

    /// Selects and prepares the addressed bank. Application banks are
    /// erased on open; auxiliary banks are left alone so incremental
    /// flows can append.
    fn prepare_bank(&mut self, target: Target) -> Result<(), Error> {
        let bank = bank_of(target);
        if target.is_spi() {
            info!("write request for auxiliary bank {}", bank.as_usize());
            self.spi_flash.set_area(self.spi.bank_area(bank));
        } else {
            info!("write request for application bank {}", bank.as_usize());
            self.app_flash.set_area(self.boot.bank_area(bank));
            self.app_flash.erase()?;
        }
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<(), Error> {
        match self.context.target {
            Some(target) if target.is_spi() => self.spi_flash.write(payload)?,
            Some(_) => self.app_flash.write(payload)?,
            None => return Err(Error::NoTransferInProgress),
        }
        Ok(())
    }

    /// End-of-transfer integrity check. Only a matching CRC32 updates
    /// the addressed descriptor; on mismatch the descriptor keeps its
    /// pre-transfer state and the session dies.
    fn finalize(&mut self, received: u32) -> Result<Outcome, Error> {
        let target = self.context.target.ok_or(Error::NoTransferInProgress)?;
        let bank = bank_of(target);
        self.context.crc_received = true;

        if target.is_spi() {
            let file_size = self.spi_flash.flush()?;
            let computed = self.spi_flash.crc(file_size)?;
            if computed != received {
                error!("auxiliary crc mismatch: {:x} received, {:x} computed", received, computed);
                return Err(Error::CrcMismatch { received, computed });
            }
            let region_crc = self.spi_flash.crc(self.spi.crc_length(bank))?;
            let partition = &mut self.spi.banks[bank.as_usize()];
            partition.file_size = file_size;
            partition.file_crc32 = computed;
            partition.crc32 = region_crc;
            self.spi.active = match bank {
                BankIndex::Bank0 => ActiveBank::Bank0,
                BankIndex::Bank1 => ActiveBank::Bank1,
            };
            info!("auxiliary bank {} verified, {} file bytes", bank.as_usize(), file_size);
            self.send_ack()?;
            Ok(Outcome::UpdateSpiContext(target))
        } else {
            let written = self.app_flash.flush()?;
            let computed = self.app_flash.crc(0)?;
            if computed != received {
                error!("application crc mismatch: {:x} received, {:x} computed", received, computed);
                return Err(Error::CrcMismatch { received, computed });
            }
            let partition = &mut self.boot.banks[bank.as_usize()];
            partition.crc32 = computed;
            partition.content_size = written;
            info!("application bank {} verified, {} bytes", bank.as_usize(), written);
            self.send_ack()?;
            Ok(Outcome::UpdateBootContext(target))
        }
    }

    fn send_ack(&mut self) -> Result<(), Error> {
        let mut buffer = [0u8; PACKET_SIZE];
        let length = Packet::Ack { block: self.context.last_block }.encode(&mut buffer);
        self.transport.write(&buffer[..length])?;
        Ok(())
    }
}

fn bank_of(target: Target) -> BankIndex {
    if target.bank_index() == 0 {
        BankIndex::Bank0
    } else {
        BankIndex::Bank1
    }
}

/// Reads one frame, tolerating a single spurious empty read. The second
/// consecutive empty frame means the link is gone.
fn read_frame<T: Transport>(transport: &mut T, buffer: &mut [u8]) -> Result<usize, Error> {
    let length = transport.read(buffer)?;
    if length > 0 {
        return Ok(length);
    }
    warning!("empty frame received, retrying read once");
    let length = transport.read(buffer)?;
    if length == 0 {
        return Err(Error::Transport("two consecutive empty reads"));
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::partitions::EMPTY_CRC;
    use crate::devices::protocol::{ErrorCode, DATA_SIZE};
    use crate::hal::doubles::{storage::FakeStorage, transport::FakeTransport};
    use crate::hal::storage::Area;
    use crc::{crc32, Hasher32};
    use pretty_assertions::assert_eq;

    const APPROM0: Area = Area::new("approm0", 0x0000, 0x800);
    // Sized to the image used by the happy-path scenario, so the
    // whole-partition CRC equals the CRC of the pushed bytes.
    const APPROM1: Area = Area::new("approm1", 0x0800, 1061);
    const SPI0: Area = Area::new("spi0", 0x0000, 0x1000);
    const SPI1: Area = Area::new("spi1", 0x1000, 0x1000);

    struct Fixture {
        transport: FakeTransport,
        app_flash: FakeStorage,
        spi_flash: FakeStorage,
        boot: BootContext,
        spi: SpiContext,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                transport: FakeTransport::new(),
                app_flash: FakeStorage::new(0x2000),
                spi_flash: FakeStorage::new(0x2000),
                boot: BootContext::fresh([APPROM0, APPROM1]),
                spi: SpiContext::fresh([SPI0, SPI1]),
            }
        }

        fn push(&mut self, packet: Packet) {
            let mut buffer = [0u8; PACKET_SIZE];
            let length = packet.encode(&mut buffer);
            self.transport.push_frame(&buffer[..length]);
        }

        fn run(&mut self) -> Result<Outcome, Error> {
            let mut session = Session::new(
                &mut self.transport,
                &mut self.app_flash,
                &mut self.spi_flash,
                &mut self.boot,
                &mut self.spi,
            );
            session.run()
        }
    }

    fn image(length: usize) -> Vec<u8> {
        (0..length).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn checksum(bytes: &[u8]) -> u32 {
        let mut digest = crc32::Digest::new(crc32::IEEE);
        digest.write(bytes);
        digest.sum32()
    }

    fn push_write(fixture: &mut Fixture, target: Target, bytes: &[u8]) {
        fixture.push(Packet::WriteRequest { target });
        for (index, chunk) in bytes.chunks(DATA_SIZE).enumerate() {
            fixture.push(Packet::Data { block: index as u16 + 1, payload: chunk });
        }
        fixture.push(Packet::Command(Command::Crc(checksum(bytes))));
    }

    #[test]
    fn full_write_transfer_updates_the_addressed_descriptor() {
        let mut fixture = Fixture::new();
        let input = image(1061); // 512 + 512 + 37
        push_write(&mut fixture, Target::AppBank1, &input);

        let outcome = fixture.run().unwrap();
        assert_eq!(outcome, Outcome::UpdateBootContext(Target::AppBank1));

        // The descriptor now carries the finalized CRC and size, and the
        // bank holds the image byte for byte.
        assert_eq!(fixture.boot.banks[1].crc32, checksum(&input));
        assert_eq!(fixture.boot.banks[1].content_size, 1061);
        assert_eq!(fixture.app_flash.snapshot(APPROM1.start, 1061), input);

        // One ack per request/data/crc packet, each echoing the block.
        let acks: Vec<Vec<u8>> = [0u16, 1, 2, 3, 3]
            .iter()
            .map(|&block| {
                let mut buffer = [0u8; PACKET_SIZE];
                let length = Packet::Ack { block }.encode(&mut buffer);
                buffer[..length].to_vec()
            })
            .collect();
        assert_eq!(fixture.transport.sent(), &acks[..]);
    }

    #[test]
    fn skipped_block_kills_the_session_without_descriptor_update() {
        let mut fixture = Fixture::new();
        let input = image(1061);
        fixture.push(Packet::WriteRequest { target: Target::AppBank1 });
        fixture.push(Packet::Data { block: 1, payload: &input[0..512] });
        fixture.push(Packet::Data { block: 2, payload: &input[512..1024] });
        fixture.push(Packet::Data { block: 5, payload: &input[1024..] }); // skips 3 and 4

        let mut session = Session::new(
            &mut fixture.transport,
            &mut fixture.app_flash,
            &mut fixture.spi_flash,
            &mut fixture.boot,
            &mut fixture.spi,
        );
        assert_eq!(session.run(), Err(Error::Sequence { expected: 3, received: 5 }));
        // The wreck is visible: still in progress until externally reset.
        assert!(session.transfer_context().in_progress);
        assert_eq!(fixture.boot.banks[1].crc32, EMPTY_CRC);
    }

    #[test]
    fn wrong_final_crc_leaves_the_descriptor_untouched() {
        let mut fixture = Fixture::new();
        let input = image(1061);
        fixture.push(Packet::WriteRequest { target: Target::AppBank1 });
        for (index, chunk) in input.chunks(DATA_SIZE).enumerate() {
            fixture.push(Packet::Data { block: index as u16 + 1, payload: chunk });
        }
        let received = checksum(&input) ^ 1;
        fixture.push(Packet::Command(Command::Crc(received)));

        let computed = checksum(&input);
        assert_eq!(fixture.run(), Err(Error::CrcMismatch { received, computed }));
        assert_eq!(fixture.boot.banks[1].crc32, EMPTY_CRC);
        assert_eq!(fixture.boot.banks[1].content_size, 0);
    }

    #[test]
    fn second_write_request_mid_transfer_is_rejected() {
        let mut fixture = Fixture::new();
        fixture.push(Packet::WriteRequest { target: Target::AppBank0 });
        fixture.push(Packet::WriteRequest { target: Target::AppBank1 });

        assert_eq!(fixture.run(), Err(Error::TransferInProgress));
    }

    #[test]
    fn auxiliary_transfer_records_file_and_region_checksums() {
        let mut fixture = Fixture::new();
        let input = image(700);
        push_write(&mut fixture, Target::SpiBank0, &input);

        let outcome = fixture.run().unwrap();
        assert_eq!(outcome, Outcome::UpdateSpiContext(Target::SpiBank0));

        let partition = &fixture.spi.banks[0];
        assert_eq!(partition.file_size, 700);
        assert_eq!(partition.file_crc32, checksum(&input));
        // The region CRC covers content_size bytes, erased tail included.
        let mut region = input.clone();
        region.resize(0x1000, 0xFF);
        assert_eq!(partition.crc32, checksum(&region));
        assert_eq!(fixture.spi.active, ActiveBank::Bank0);
    }

    #[test]
    fn reading_an_unused_bank_sends_no_data_blocks() {
        let mut fixture = Fixture::new();
        fixture.push(Packet::ReadRequest { length: 0, target: Target::AppBank0 });
        fixture.push(Packet::Command(Command::End));

        assert_eq!(fixture.run().unwrap(), Outcome::Command(Command::End));

        // Only the terminating command went out, no data packets.
        let mut buffer = [0u8; PACKET_SIZE];
        let length = Packet::Command(Command::End).encode(&mut buffer);
        assert_eq!(fixture.transport.sent(), &[buffer[..length].to_vec()]);
    }

    #[test]
    fn written_image_reads_back_identically() {
        let mut fixture = Fixture::new();
        let input = image(1061);
        push_write(&mut fixture, Target::AppBank1, &input);
        assert_eq!(fixture.run().unwrap(), Outcome::UpdateBootContext(Target::AppBank1));

        // Second session: pull the same region back. The device streams
        // blocks numbered from zero, waiting for our scripted acks.
        fixture.push(Packet::ReadRequest { length: 1061, target: Target::AppBank1 });
        for block in [0u16, 1, 2] {
            fixture.push(Packet::Ack { block });
        }
        fixture.push(Packet::Command(Command::End));
        let sent_before = fixture.transport.sent().len();
        assert_eq!(fixture.run().unwrap(), Outcome::Command(Command::End));

        let frames = &fixture.transport.sent()[sent_before..];
        let mut readback = Vec::new();
        for frame in &frames[..frames.len() - 1] {
            match protocol::parse(frame).unwrap() {
                Packet::Data { payload, .. } => readback.extend_from_slice(payload),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(readback, input);
        // The stream ends with the application terminator.
        assert_eq!(
            protocol::parse(frames.last().unwrap()).unwrap(),
            Packet::Command(Command::End)
        );
    }

    #[test]
    fn one_empty_read_is_tolerated_two_are_fatal() {
        let mut fixture = Fixture::new();
        fixture.transport.push_empty();
        fixture.push(Packet::Command(Command::Reset));
        assert_eq!(fixture.run().unwrap(), Outcome::Command(Command::Reset));

        fixture.transport.push_empty();
        fixture.transport.push_empty();
        assert_eq!(fixture.run(), Err(Error::Transport("two consecutive empty reads")));
    }

    #[test]
    fn peer_error_packet_ends_the_session() {
        let mut fixture = Fixture::new();
        fixture.push(Packet::Error { code: ErrorCode::Write, message: b"flash failed" });
        assert_eq!(fixture.run(), Err(Error::Peer(ErrorCode::Write as u16)));
    }

    #[test]
    fn boot_info_is_signalled_then_served() {
        let mut fixture = Fixture::new();
        fixture.boot.banks[0].crc32 = 0x1234_5678;
        fixture.push(Packet::Command(Command::BootInfo));

        let mut session = Session::new(
            &mut fixture.transport,
            &mut fixture.app_flash,
            &mut fixture.spi_flash,
            &mut fixture.boot,
            &mut fixture.spi,
        );
        assert_eq!(session.run().unwrap(), Outcome::Command(Command::BootInfo));
        session.send_boot_info().unwrap();

        let frame = fixture.transport.sent().last().unwrap().clone();
        assert_eq!(&frame[..4], &[0x00, 0x06, 0x00, 0x04]);
        let decoded = BootContext::decode(&frame[4..4 + BootContext::SIZE]);
        assert_eq!(decoded.banks[0].crc32, 0x1234_5678);
    }
}
