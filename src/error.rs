//! Error types for the bootloader core as a whole.
//!
//! Unlike the module-specific driver errors, this error is terminal: once
//! raised, the current packet exchange is over and the caller decides
//! whether to resynchronize, stay in update mode or reboot.
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Structurally invalid packet: bad lead byte, unknown opcode, bad
    /// size, or a kind-specific layout violation.
    #[error("malformed packet: {0}")]
    Framing(&'static str),

    /// A data or acknowledge packet carried the wrong block number.
    #[error("block {received} out of sequence (expected {expected})")]
    Sequence { expected: u16, received: u16 },

    /// End-of-transfer integrity check failed. The addressed descriptor
    /// is left untouched.
    #[error("crc mismatch (received {received:#010x}, computed {computed:#010x})")]
    CrcMismatch { received: u32, computed: u32 },

    /// A read or write request arrived while a transfer was running.
    #[error("a transfer is already in progress")]
    TransferInProgress,

    /// A data or acknowledge packet arrived outside a transfer.
    #[error("no transfer in progress")]
    NoTransferInProgress,

    /// The request named a target outside the fixed name table.
    #[error("unknown transfer target")]
    UnknownTarget,

    /// The peer sent an error packet with the given code.
    #[error("peer reported error code {0}")]
    Peer(u16),

    /// A well-formed packet that makes no sense at this protocol stage.
    #[error("unexpected packet for the current protocol stage")]
    UnexpectedPacket,

    /// Failure propagated from the storage backend.
    #[error("storage backend fault: {0}")]
    Storage(&'static str),

    /// Failure propagated from the transport driver, including the second
    /// of two consecutive empty reads.
    #[error("transport fault: {0}")]
    Transport(&'static str),

    /// Primary and backup boot metadata are both unusable; the caller
    /// must stay in update mode.
    #[error("boot metadata unrecoverable on both copies")]
    ContextCorrupt,

    /// A persisted context, read back after writing, did not match.
    #[error("context readback does not match what was written")]
    ReadbackMismatch,
}

/// Implemented by driver error types so they can flow into [`Error`]
/// through `?` at the device layer.
pub trait Convertible {
    fn into(self) -> Error;
}

impl<T: Convertible> From<T> for Error {
    fn from(t: T) -> Self {
        t.into()
    }
}
