//! Partition descriptors and the persisted boot metadata.
//!
//! Two descriptor tables exist per device: one for the application banks
//! on internal flash, one for the auxiliary bitstream banks on SPI
//! flash. Each table lives in flash twice (primary and backup), guarded
//! by a CRC32 over the descriptor array only, so one corrupt copy can be
//! rebuilt from the other. Layouts are little-endian and encoded field
//! by field; no struct is ever aliased onto flash bytes.

pub mod manager;

pub use manager::{Loaded, PartitionManager, PartitionState, Recovery};

use crate::hal::storage::Area;
use crc::{crc32, Hasher32};
use static_assertions::const_assert;

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reserved CRC32 value meaning "this descriptor is unused", not a real
/// checksum.
pub const EMPTY_CRC: u32 = 0xDEAD_BEEF;

/// Banks per descriptor table. Exactly two; the A/B redundancy scheme
/// does not generalize further.
pub const BANK_COUNT: usize = 2;

/// Upper bound on an encoded context, sized for stack buffers.
pub(crate) const MAX_CONTEXT_SIZE: usize = 64;

/// Addresses one bank of a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BankIndex {
    Bank0,
    Bank1,
}

impl BankIndex {
    pub const fn as_usize(self) -> usize {
        match self {
            BankIndex::Bank0 => 0,
            BankIndex::Bank1 => 1,
        }
    }

    pub const fn other(self) -> BankIndex {
        match self {
            BankIndex::Bank0 => BankIndex::Bank1,
            BankIndex::Bank1 => BankIndex::Bank0,
        }
    }
}

/// The persisted active-bank selector. `None` is only ever the state of
/// a freshly initialized table; a swap always lands on a concrete bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActiveBank {
    #[default]
    None,
    Bank0,
    Bank1,
}

impl ActiveBank {
    /// The bank a swap moves to. Two-valued: swapping away from `None`
    /// selects bank 0.
    pub const fn other(self) -> ActiveBank {
        match self {
            ActiveBank::Bank0 => ActiveBank::Bank1,
            _ => ActiveBank::Bank0,
        }
    }

    pub const fn index(self) -> Option<BankIndex> {
        match self {
            ActiveBank::None => None,
            ActiveBank::Bank0 => Some(BankIndex::Bank0),
            ActiveBank::Bank1 => Some(BankIndex::Bank1),
        }
    }

    fn encode(self) -> u8 {
        match self {
            ActiveBank::None => (-1i8) as u8,
            ActiveBank::Bank0 => 0,
            ActiveBank::Bank1 => 1,
        }
    }

    fn decode(byte: u8) -> ActiveBank {
        match byte {
            0 => ActiveBank::Bank0,
            1 => ActiveBank::Bank1,
            _ => ActiveBank::None,
        }
    }
}

/// Application bank descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    pub start_addr: u32,
    pub content_size: u32,
    pub partition_size: u32,
    pub crc32: u32,
}

impl Partition {
    pub const SIZE: usize = 16;

    pub const fn unused(start_addr: u32, partition_size: u32) -> Partition {
        Partition { start_addr, content_size: 0, partition_size, crc32: EMPTY_CRC }
    }

    pub const fn is_unused(&self) -> bool {
        self.crc32 == EMPTY_CRC
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.start_addr.to_le_bytes());
        out[4..8].copy_from_slice(&self.content_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.partition_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.crc32.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Partition {
        Partition {
            start_addr: le_u32(&bytes[0..4]),
            content_size: le_u32(&bytes[4..8]),
            partition_size: le_u32(&bytes[8..12]),
            crc32: le_u32(&bytes[12..16]),
        }
    }
}

/// Auxiliary (bitstream) bank descriptor. On top of the region CRC it
/// records the size and CRC32 of the uploaded file itself, which covers
/// fewer bytes than the erased region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiPartition {
    pub start_addr: u32,
    pub content_size: u32,
    pub partition_size: u32,
    pub crc32: u32,
    pub file_size: u32,
    pub file_crc32: u32,
}

impl SpiPartition {
    pub const SIZE: usize = 24;

    pub const fn unused(start_addr: u32, partition_size: u32) -> SpiPartition {
        SpiPartition {
            start_addr,
            content_size: partition_size,
            partition_size,
            crc32: EMPTY_CRC,
            file_size: 0,
            file_crc32: EMPTY_CRC,
        }
    }

    pub const fn is_unused(&self) -> bool {
        self.crc32 == EMPTY_CRC
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.start_addr.to_le_bytes());
        out[4..8].copy_from_slice(&self.content_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.partition_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.crc32.to_le_bytes());
        out[16..20].copy_from_slice(&self.file_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.file_crc32.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> SpiPartition {
        SpiPartition {
            start_addr: le_u32(&bytes[0..4]),
            content_size: le_u32(&bytes[4..8]),
            partition_size: le_u32(&bytes[8..12]),
            crc32: le_u32(&bytes[12..16]),
            file_size: le_u32(&bytes[16..20]),
            file_crc32: le_u32(&bytes[20..24]),
        }
    }
}

/// Persisted boot metadata shared behavior: fixed-size little-endian
/// encoding with the own-CRC covering the descriptor table only, and
/// enough descriptor access for the manager to validate and heal banks.
pub trait PersistedContext: Sized + Copy + PartialEq {
    /// Encoded size: descriptor table, own CRC32, active selector.
    const SIZE: usize;
    /// Byte span of the descriptor table, the range the own CRC covers.
    const TABLE_SIZE: usize;
    /// Wire names of the two banks, used to label storage areas.
    const BANK_NAMES: [&'static str; BANK_COUNT];

    /// A table of unused banks over the given areas, no active bank.
    fn fresh(banks: [Area; BANK_COUNT]) -> Self;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;

    fn active(&self) -> ActiveBank;
    fn set_active(&mut self, active: ActiveBank);
    fn crc32(&self) -> u32;
    fn set_crc32(&mut self, crc: u32);

    fn bank_area(&self, bank: BankIndex) -> Area;
    fn bank_crc(&self, bank: BankIndex) -> u32;
    fn set_bank_crc(&mut self, bank: BankIndex, crc: u32);

    /// Length handed to the storage CRC when checking this bank: zero
    /// (whole partition) for application banks, `content_size` for
    /// auxiliary banks.
    fn crc_length(&self, bank: BankIndex) -> u32;

    /// CRC32 over the encoded descriptor table.
    fn table_crc(&self) -> u32 {
        let mut buffer = [0u8; MAX_CONTEXT_SIZE];
        self.encode(&mut buffer[..Self::SIZE]);
        let mut digest = crc32::Digest::new(crc32::IEEE);
        digest.write(&buffer[..Self::TABLE_SIZE]);
        digest.sum32()
    }
}

/// Boot metadata for the two application banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootContext {
    pub banks: [Partition; BANK_COUNT],
    pub crc32: u32,
    pub active: ActiveBank,
}

impl PersistedContext for BootContext {
    const SIZE: usize = BANK_COUNT * Partition::SIZE + 5;
    const TABLE_SIZE: usize = BANK_COUNT * Partition::SIZE;
    const BANK_NAMES: [&'static str; BANK_COUNT] = ["approm0", "approm1"];

    fn fresh(banks: [Area; BANK_COUNT]) -> BootContext {
        BootContext {
            banks: [
                Partition::unused(banks[0].start, banks[0].size),
                Partition::unused(banks[1].start, banks[1].size),
            ],
            crc32: 0,
            active: ActiveBank::None,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        self.banks[0].encode(&mut out[0..Partition::SIZE]);
        self.banks[1].encode(&mut out[Partition::SIZE..2 * Partition::SIZE]);
        out[32..36].copy_from_slice(&self.crc32.to_le_bytes());
        out[36] = self.active.encode();
    }

    fn decode(bytes: &[u8]) -> BootContext {
        BootContext {
            banks: [
                Partition::decode(&bytes[0..Partition::SIZE]),
                Partition::decode(&bytes[Partition::SIZE..2 * Partition::SIZE]),
            ],
            crc32: le_u32(&bytes[32..36]),
            active: ActiveBank::decode(bytes[36]),
        }
    }

    fn active(&self) -> ActiveBank {
        self.active
    }

    fn set_active(&mut self, active: ActiveBank) {
        self.active = active;
    }

    fn crc32(&self) -> u32 {
        self.crc32
    }

    fn set_crc32(&mut self, crc: u32) {
        self.crc32 = crc;
    }

    fn bank_area(&self, bank: BankIndex) -> Area {
        let partition = &self.banks[bank.as_usize()];
        Area::new(Self::BANK_NAMES[bank.as_usize()], partition.start_addr, partition.partition_size)
    }

    fn bank_crc(&self, bank: BankIndex) -> u32 {
        self.banks[bank.as_usize()].crc32
    }

    fn set_bank_crc(&mut self, bank: BankIndex, crc: u32) {
        self.banks[bank.as_usize()].crc32 = crc;
    }

    fn crc_length(&self, _bank: BankIndex) -> u32 {
        0 // application banks are checked over the whole partition
    }
}

/// Boot metadata for the two auxiliary bitstream banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiContext {
    pub banks: [SpiPartition; BANK_COUNT],
    pub crc32: u32,
    pub active: ActiveBank,
}

impl PersistedContext for SpiContext {
    const SIZE: usize = BANK_COUNT * SpiPartition::SIZE + 5;
    const TABLE_SIZE: usize = BANK_COUNT * SpiPartition::SIZE;
    const BANK_NAMES: [&'static str; BANK_COUNT] = ["spi0", "spi1"];

    fn fresh(banks: [Area; BANK_COUNT]) -> SpiContext {
        SpiContext {
            banks: [
                SpiPartition::unused(banks[0].start, banks[0].size),
                SpiPartition::unused(banks[1].start, banks[1].size),
            ],
            crc32: 0,
            active: ActiveBank::None,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        self.banks[0].encode(&mut out[0..SpiPartition::SIZE]);
        self.banks[1].encode(&mut out[SpiPartition::SIZE..2 * SpiPartition::SIZE]);
        out[48..52].copy_from_slice(&self.crc32.to_le_bytes());
        out[52] = self.active.encode();
    }

    fn decode(bytes: &[u8]) -> SpiContext {
        SpiContext {
            banks: [
                SpiPartition::decode(&bytes[0..SpiPartition::SIZE]),
                SpiPartition::decode(&bytes[SpiPartition::SIZE..2 * SpiPartition::SIZE]),
            ],
            crc32: le_u32(&bytes[48..52]),
            active: ActiveBank::decode(bytes[52]),
        }
    }

    fn active(&self) -> ActiveBank {
        self.active
    }

    fn set_active(&mut self, active: ActiveBank) {
        self.active = active;
    }

    fn crc32(&self) -> u32 {
        self.crc32
    }

    fn set_crc32(&mut self, crc: u32) {
        self.crc32 = crc;
    }

    fn bank_area(&self, bank: BankIndex) -> Area {
        let partition = &self.banks[bank.as_usize()];
        Area::new(Self::BANK_NAMES[bank.as_usize()], partition.start_addr, partition.partition_size)
    }

    fn bank_crc(&self, bank: BankIndex) -> u32 {
        self.banks[bank.as_usize()].crc32
    }

    fn set_bank_crc(&mut self, bank: BankIndex, crc: u32) {
        self.banks[bank.as_usize()].crc32 = crc;
    }

    fn crc_length(&self, bank: BankIndex) -> u32 {
        self.banks[bank.as_usize()].content_size
    }
}

const_assert!(BootContext::SIZE <= MAX_CONTEXT_SIZE);
const_assert!(SpiContext::SIZE <= MAX_CONTEXT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_boot_context() -> BootContext {
        BootContext {
            banks: [
                Partition {
                    start_addr: 0x0002_0000,
                    content_size: 0x1_2345,
                    partition_size: 0x4_0000,
                    crc32: 0x1122_3344,
                },
                Partition::unused(0x0006_0000, 0x4_0000),
            ],
            crc32: 0,
            active: ActiveBank::Bank0,
        }
    }

    #[test]
    fn boot_context_layout_is_bit_exact() {
        let mut bytes = [0u8; BootContext::SIZE];
        sample_boot_context().encode(&mut bytes);

        // First descriptor, little-endian fields at fixed offsets.
        assert_eq!(&bytes[0..4], &0x0002_0000u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x1_2345u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x4_0000u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0x1122_3344u32.to_le_bytes());
        // Second descriptor carries the unused sentinel.
        assert_eq!(&bytes[28..32], &EMPTY_CRC.to_le_bytes());
        // Own CRC slot and the active selector trailer.
        assert_eq!(&bytes[32..36], &[0, 0, 0, 0]);
        assert_eq!(bytes[36], 0);

        assert_eq!(BootContext::decode(&bytes), sample_boot_context());
    }

    #[test]
    fn own_crc_covers_the_descriptor_table_only() {
        let mut context = sample_boot_context();
        let crc = context.table_crc();
        context.crc32 = crc;

        // Neither the own CRC slot nor the active selector feed back
        // into the table CRC.
        context.active = ActiveBank::Bank1;
        assert_eq!(context.table_crc(), crc);

        context.banks[1].crc32 = 0x5566_7788;
        assert_ne!(context.table_crc(), crc);
    }

    #[test]
    fn spi_context_records_file_and_region_checksums_separately() {
        let mut context = SpiContext::fresh([
            Area::new("spi0", 0x0000_0000, 0x4_0000),
            Area::new("spi1", 0x0004_0000, 0x4_0000),
        ]);
        context.banks[0].file_size = 0x3_60B8;
        context.banks[0].file_crc32 = 0xAABB_CCDD;
        context.banks[0].crc32 = 0x0102_0304;

        let mut bytes = [0u8; SpiContext::SIZE];
        context.encode(&mut bytes);
        let decoded = SpiContext::decode(&bytes);

        assert_eq!(decoded, context);
        assert_eq!(decoded.banks[0].file_crc32, 0xAABB_CCDD);
        assert_eq!(decoded.banks[0].crc32, 0x0102_0304);
        // The fresh second bank still holds sentinels.
        assert!(decoded.banks[1].is_unused());
        assert_eq!(decoded.banks[1].file_crc32, EMPTY_CRC);
    }

    #[test]
    fn active_selector_survives_the_trailer_byte() {
        for active in [ActiveBank::None, ActiveBank::Bank0, ActiveBank::Bank1] {
            let mut context = sample_boot_context();
            context.active = active;
            let mut bytes = [0u8; BootContext::SIZE];
            context.encode(&mut bytes);
            assert_eq!(BootContext::decode(&bytes).active, active);
        }
    }

    #[test]
    fn swapping_away_from_none_lands_on_bank_zero() {
        assert_eq!(ActiveBank::None.other(), ActiveBank::Bank0);
        assert_eq!(ActiveBank::Bank0.other(), ActiveBank::Bank1);
        assert_eq!(ActiveBank::Bank1.other(), ActiveBank::Bank0);
    }
}
