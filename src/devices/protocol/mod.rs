//! Block transfer packet codec.
//!
//! Seven packet kinds share a two-byte header: a zero lead byte and an
//! opcode. Data packets carry up to 512 payload bytes behind a big-endian
//! block number; everything multi-byte on the wire is big-endian. Packets
//! are decoded once into a [`Packet`] sum type and dispatched by pattern
//! match — there is no handler table indexed by raw bytes, and no struct
//! is ever aliased onto a buffer.

pub mod context;

pub use context::TransferContext;

use crate::error::Error;
use nom::{
    bytes::complete::{tag, take_till},
    number::complete::{be_u16, be_u32},
    IResult,
};
use static_assertions::const_assert_eq;

/// Total size of a full data packet; also the receive buffer size.
pub const PACKET_SIZE: usize = 516;
/// Payload capacity of one data packet.
pub const DATA_SIZE: usize = 512;
/// Zero byte, opcode, and big-endian block number.
pub const DATA_HEADER_SIZE: usize = 4;
/// Acknowledge packets are header plus block number, nothing else.
pub const ACK_SIZE: usize = 4;
/// Error packets: 4-byte header plus a NUL-terminated message.
pub const ERROR_SIZE: usize = 128;
pub const ERROR_MAX_STRING: usize = 124;
/// Generic command packet; the CRC command appends a big-endian u32.
pub const COMMAND_SIZE: usize = 4;
pub const COMMAND_CRC_SIZE: usize = 8;
/// Fixed budget for a target name on the wire, terminator included.
pub const TARGET_NAME_SIZE: usize = 8;
/// Read requests: header, big-endian length, zero-padded target name.
pub const READ_REQUEST_SIZE: usize = 6 + TARGET_NAME_SIZE;
/// Write requests: header and zero-padded target name.
pub const WRITE_REQUEST_SIZE: usize = 2 + TARGET_NAME_SIZE;

const_assert_eq!(DATA_HEADER_SIZE + DATA_SIZE, PACKET_SIZE);
const_assert_eq!(COMMAND_SIZE + ERROR_MAX_STRING, ERROR_SIZE);

/// Raw opcode values, byte 1 of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    ReadRequest = 0x1,
    WriteRequest = 0x2,
    Data = 0x3,
    Ack = 0x4,
    Error = 0x5,
    Command = 0x6,
    Debug = 0x7,
}

impl Opcode {
    fn from_byte(byte: u8) -> Option<Opcode> {
        match byte {
            0x1 => Some(Opcode::ReadRequest),
            0x2 => Some(Opcode::WriteRequest),
            0x3 => Some(Opcode::Data),
            0x4 => Some(Opcode::Ack),
            0x5 => Some(Opcode::Error),
            0x6 => Some(Opcode::Command),
            0x7 => Some(Opcode::Debug),
            _ => None,
        }
    }
}

/// Transfer targets, identified on the wire by a fixed name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Target {
    AppBank0,
    AppBank1,
    SpiBank0,
    SpiBank1,
}

impl Target {
    pub const fn wire_name(self) -> &'static str {
        match self {
            Target::AppBank0 => "approm0",
            Target::AppBank1 => "approm1",
            Target::SpiBank0 => "spi0",
            Target::SpiBank1 => "spi1",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Target> {
        match name {
            b"approm0" => Some(Target::AppBank0),
            b"approm1" => Some(Target::AppBank1),
            b"spi0" => Some(Target::SpiBank0),
            b"spi1" => Some(Target::SpiBank1),
            _ => None,
        }
    }

    /// Auxiliary (bitstream) targets live on the SPI flash backend.
    pub const fn is_spi(self) -> bool {
        matches!(self, Target::SpiBank0 | Target::SpiBank1)
    }

    /// Index into the two-bank descriptor table of the target's category.
    pub const fn bank_index(self) -> usize {
        match self {
            Target::AppBank0 | Target::SpiBank0 => 0,
            Target::AppBank1 | Target::SpiBank1 => 1,
        }
    }
}

/// Error codes carried by error packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ErrorCode {
    Sequence = 0x1,
    Write = 0x2,
}

impl ErrorCode {
    fn from_code(code: u16) -> Option<ErrorCode> {
        match code {
            0x1 => Some(ErrorCode::Sequence),
            0x2 => Some(ErrorCode::Write),
            _ => None,
        }
    }
}

/// Session commands. All of these end the receiver loop; the numeric
/// value is what travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Boot,
    /// Finalizes a write transfer with the CRC32 of the pushed image.
    Crc(u32),
    Swap,
    BootInfo,
    PowerOn,
    PowerOff,
    End,
    Reset,
    TriggerWatchdog,
    EraseSpi,
    SpiEnd,
    SetBank0,
    SetBank1,
}

impl Command {
    pub const fn code(self) -> u16 {
        match self {
            Command::Boot => 0x1,
            Command::Crc(_) => 0x2,
            Command::Swap => 0x3,
            Command::BootInfo => 0x4,
            Command::PowerOn => 0x5,
            Command::PowerOff => 0x6,
            Command::End => 0x7,
            Command::Reset => 0x8,
            Command::TriggerWatchdog => 0x9,
            Command::EraseSpi => 0xA,
            Command::SpiEnd => 0xB,
            Command::SetBank0 => 0xC,
            Command::SetBank1 => 0xD,
        }
    }

    fn parse(code: u16, payload: &[u8]) -> Result<Command, Error> {
        Ok(match code {
            0x1 => Command::Boot,
            0x2 => {
                let (_, crc) = be_u32::<_, nom::error::Error<&[u8]>>(payload)
                    .map_err(|_| Error::Framing("crc command without checksum"))?;
                Command::Crc(crc)
            }
            0x3 => Command::Swap,
            0x4 => Command::BootInfo,
            0x5 => Command::PowerOn,
            0x6 => Command::PowerOff,
            0x7 => Command::End,
            0x8 => Command::Reset,
            0x9 => Command::TriggerWatchdog,
            0xA => Command::EraseSpi,
            0xB => Command::SpiEnd,
            0xC => Command::SetBank0,
            0xD => Command::SetBank1,
            _ => return Err(Error::Framing("unknown command code")),
        })
    }
}

/// One decoded packet. Payload-carrying kinds borrow from the receive
/// buffer; nothing is copied during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    ReadRequest { length: u32, target: Target },
    WriteRequest { target: Target },
    Data { block: u16, payload: &'a [u8] },
    Ack { block: u16 },
    Error { code: ErrorCode, message: &'a [u8] },
    Command(Command),
    Debug { payload: &'a [u8] },
}

fn terminated_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, name) = take_till(|b| b == 0)(input)?;
    let (input, _) = tag([0u8].as_slice())(input)?;
    Ok((input, name))
}

fn target(name: &[u8]) -> Result<Target, Error> {
    Target::from_wire_name(name).ok_or(Error::UnknownTarget)
}

/// Decodes and structurally validates one received frame.
pub fn parse(input: &[u8]) -> Result<Packet<'_>, Error> {
    if input.len() < 2 {
        return Err(Error::Framing("packet too short"));
    }
    if input.len() > PACKET_SIZE {
        return Err(Error::Framing("packet exceeds maximum size"));
    }
    if input[0] != 0 {
        return Err(Error::Framing("nonzero lead byte"));
    }
    let opcode = Opcode::from_byte(input[1]).ok_or(Error::Framing("unknown opcode"))?;
    let body = &input[2..];

    match opcode {
        Opcode::ReadRequest => {
            let (rest, length) = be_u32::<_, nom::error::Error<&[u8]>>(body)
                .map_err(|_| Error::Framing("truncated read request"))?;
            let (_, name) =
                terminated_name(rest).map_err(|_| Error::Framing("unterminated target name"))?;
            Ok(Packet::ReadRequest { length, target: target(name)? })
        }
        Opcode::WriteRequest => {
            let (_, name) =
                terminated_name(body).map_err(|_| Error::Framing("unterminated target name"))?;
            Ok(Packet::WriteRequest { target: target(name)? })
        }
        Opcode::Data => {
            let (payload, block) = be_u16::<_, nom::error::Error<&[u8]>>(body)
                .map_err(|_| Error::Framing("truncated data packet"))?;
            Ok(Packet::Data { block, payload })
        }
        Opcode::Ack => {
            let (_, block) = be_u16::<_, nom::error::Error<&[u8]>>(body)
                .map_err(|_| Error::Framing("truncated acknowledge packet"))?;
            Ok(Packet::Ack { block })
        }
        Opcode::Error => {
            let (rest, code) = be_u16::<_, nom::error::Error<&[u8]>>(body)
                .map_err(|_| Error::Framing("truncated error packet"))?;
            let code = ErrorCode::from_code(code).ok_or(Error::Framing("unknown error code"))?;
            let message = match rest.iter().position(|&b| b == 0) {
                Some(nul) => &rest[..nul],
                None => rest,
            };
            if message.len() > ERROR_MAX_STRING {
                return Err(Error::Framing("error message too long"));
            }
            Ok(Packet::Error { code, message })
        }
        Opcode::Command => {
            let (payload, code) = be_u16::<_, nom::error::Error<&[u8]>>(body)
                .map_err(|_| Error::Framing("truncated command packet"))?;
            Ok(Packet::Command(Command::parse(code, payload)?))
        }
        Opcode::Debug => Ok(Packet::Debug { payload: body }),
    }
}

impl Packet<'_> {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Packet::ReadRequest { .. } => Opcode::ReadRequest,
            Packet::WriteRequest { .. } => Opcode::WriteRequest,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Command(_) => Opcode::Command,
            Packet::Debug { .. } => Opcode::Debug,
        }
    }

    /// Encodes the packet into `out`, returning the frame length. Every
    /// field lands at its fixed offset; payloads longer than their slot
    /// are truncated to it.
    pub fn encode(&self, out: &mut [u8; PACKET_SIZE]) -> usize {
        out[0] = 0x00;
        out[1] = self.opcode() as u8;
        match *self {
            Packet::ReadRequest { length, target } => {
                out[2..6].copy_from_slice(&length.to_be_bytes());
                encode_name(target, &mut out[6..6 + TARGET_NAME_SIZE]);
                READ_REQUEST_SIZE
            }
            Packet::WriteRequest { target } => {
                encode_name(target, &mut out[2..2 + TARGET_NAME_SIZE]);
                WRITE_REQUEST_SIZE
            }
            Packet::Data { block, payload } => {
                let length = payload.len().min(DATA_SIZE);
                out[2..4].copy_from_slice(&block.to_be_bytes());
                out[4..4 + length].copy_from_slice(&payload[..length]);
                DATA_HEADER_SIZE + length
            }
            Packet::Ack { block } => {
                out[2..4].copy_from_slice(&block.to_be_bytes());
                ACK_SIZE
            }
            Packet::Error { code, message } => {
                let length = message.len().min(ERROR_MAX_STRING - 1);
                out[2..4].copy_from_slice(&(code as u16).to_be_bytes());
                out[4..4 + length].copy_from_slice(&message[..length]);
                out[4 + length] = 0x00;
                4 + length + 1
            }
            Packet::Command(command) => {
                out[2..4].copy_from_slice(&command.code().to_be_bytes());
                if let Command::Crc(crc) = command {
                    out[4..8].copy_from_slice(&crc.to_be_bytes());
                    COMMAND_CRC_SIZE
                } else {
                    COMMAND_SIZE
                }
            }
            Packet::Debug { payload } => {
                let length = payload.len().min(PACKET_SIZE - 2);
                out[2..2 + length].copy_from_slice(&payload[..length]);
                2 + length
            }
        }
    }
}

fn encode_name(target: Target, slot: &mut [u8]) {
    let name = target.wire_name().as_bytes();
    slot.fill(0);
    slot[..name.len()].copy_from_slice(name);
}
