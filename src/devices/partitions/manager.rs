//! Loading, healing and swapping of the persisted boot metadata.

use super::{ActiveBank, BankIndex, PersistedContext, EMPTY_CRC, MAX_CONTEXT_SIZE};
use crate::devices::traits::Storage;
use crate::error::Error;
use crate::hal::storage::Area;
use core::marker::PhantomData;

/// Result of checking one bank against its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PartitionState {
    /// The descriptor carries the unused sentinel; nothing was ever
    /// flashed here.
    Empty,
    Valid,
    Invalid,
}

/// What `load` had to do to produce a usable context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recovery {
    /// Both copies were valid and identical.
    Clean,
    /// Both regions read as erased; a fresh context was written.
    Initialized,
    /// The primary copy was rebuilt from the backup.
    RepairedPrimary,
    /// The backup copy was rebuilt from the primary.
    RepairedBackup,
    /// Neither copy was usable. Both were re-initialized and the caller
    /// must stay in update mode.
    Unrecoverable,
}

pub struct Loaded<C> {
    pub context: C,
    pub recovery: Recovery,
}

enum CopyState<C> {
    Empty,
    Valid(C),
    Corrupt,
}

/// Owner of one descriptor table category (application or auxiliary),
/// its two persisted copies, and the storage handle that reaches them.
///
/// All mutation of the persisted state goes through this type, and every
/// write is verified by read-back before being reported successful.
pub struct PartitionManager<S: Storage, C: PersistedContext> {
    storage: S,
    primary: Area,
    backup: Area,
    banks: [Area; super::BANK_COUNT],
    _context: PhantomData<C>,
}

impl<S: Storage, C: PersistedContext> PartitionManager<S, C> {
    pub fn new(
        storage: S,
        primary: Area,
        backup: Area,
        banks: [Area; super::BANK_COUNT],
    ) -> Self {
        PartitionManager { storage, primary, backup, banks, _context: PhantomData }
    }

    /// Reads both copies, repairs what can be repaired, and returns the
    /// authoritative context.
    pub fn load(&mut self) -> Result<Loaded<C>, Error> {
        let primary = self.read_copy(self.primary)?;
        let backup = self.read_copy(self.backup)?;

        match (primary, backup) {
            (CopyState::Valid(primary), CopyState::Valid(backup)) => {
                if primary == backup {
                    Ok(Loaded { context: primary, recovery: Recovery::Clean })
                } else {
                    // Primary is authoritative when both checksums hold.
                    warning!("boot metadata copies diverged, rewriting backup");
                    self.write_copy(self.backup, &primary)?;
                    Ok(Loaded { context: primary, recovery: Recovery::RepairedBackup })
                }
            }
            (CopyState::Valid(primary), _) => {
                warning!("backup boot metadata unusable, rebuilding from primary");
                self.write_copy(self.backup, &primary)?;
                Ok(Loaded { context: primary, recovery: Recovery::RepairedBackup })
            }
            (_, CopyState::Valid(backup)) => {
                warning!("primary boot metadata unusable, rebuilding from backup");
                self.write_copy(self.primary, &backup)?;
                Ok(Loaded { context: backup, recovery: Recovery::RepairedPrimary })
            }
            (CopyState::Corrupt, CopyState::Corrupt) => {
                // Nothing valid to heal from: wipe both copies and
                // force an update.
                error!("boot metadata unrecoverable on both copies");
                let mut context = C::fresh(self.banks);
                self.store(&mut context)?;
                Ok(Loaded { context, recovery: Recovery::Unrecoverable })
            }
            _ => {
                // Both erased, or one erased and one corrupt: start
                // from a fresh table on both copies.
                info!("boot metadata regions erased, initializing fresh context");
                let mut context = C::fresh(self.banks);
                self.store(&mut context)?;
                Ok(Loaded { context, recovery: Recovery::Initialized })
            }
        }
    }

    /// Recomputes the table CRC and persists the context to both copies.
    pub fn store(&mut self, context: &mut C) -> Result<(), Error> {
        context.set_crc32(context.table_crc());
        self.write_copy(self.primary, context)?;
        self.write_copy(self.backup, context)?;
        Ok(())
    }

    /// Checks one bank's contents against its descriptor CRC. A
    /// computed CRC of exactly zero is re-read once before the bank is
    /// declared invalid, as it usually means a transient storage glitch.
    pub fn validate_partition(
        &mut self,
        context: &C,
        bank: BankIndex,
    ) -> Result<PartitionState, Error> {
        let expected = context.bank_crc(bank);
        if expected == EMPTY_CRC {
            debug!("bank {} is unused", bank.as_usize());
            return Ok(PartitionState::Empty);
        }

        self.storage.set_area(context.bank_area(bank));
        let length = context.crc_length(bank);
        let mut computed = self.storage.crc(length)?;
        if computed == 0 {
            warning!("bank crc computed to zero, retrying read");
            computed = self.storage.crc(length)?;
        }

        if computed == expected {
            Ok(PartitionState::Valid)
        } else {
            error!(
                "bank {} crc mismatch: expected {:x}, computed {:x}",
                bank.as_usize(),
                expected,
                computed
            );
            Ok(PartitionState::Invalid)
        }
    }

    /// Toggles the active bank and persists both copies. The new
    /// selection only takes effect once the verified write succeeds.
    pub fn swap(&mut self, context: &mut C) -> Result<ActiveBank, Error> {
        let target = context.active().other();
        context.set_active(target);
        self.store(context)?;
        info!("active bank swapped");
        Ok(target)
    }

    /// Heals a stale descriptor by recomputing its CRC from the bank's
    /// on-flash contents (after external programming, for instance) and
    /// persisting the result.
    pub fn fix_crc(&mut self, context: &mut C, bank: BankIndex, length: u32) -> Result<u32, Error> {
        self.storage.set_area(context.bank_area(bank));
        let crc = self.storage.crc(length)?;
        context.set_bank_crc(bank, crc);
        self.store(context)?;
        Ok(crc)
    }

    fn read_copy(&mut self, area: Area) -> Result<CopyState<C>, Error> {
        let mut bytes = [0u8; MAX_CONTEXT_SIZE];
        let bytes = &mut bytes[..C::SIZE];
        self.storage.set_area(area);
        self.storage.read(0, bytes)?;

        if bytes.iter().all(|&b| b == 0xFF) {
            return Ok(CopyState::Empty);
        }

        let context = C::decode(bytes);
        if context.table_crc() == context.crc32() {
            Ok(CopyState::Valid(context))
        } else {
            Ok(CopyState::Corrupt)
        }
    }

    fn write_copy(&mut self, area: Area, context: &C) -> Result<(), Error> {
        let mut bytes = [0u8; MAX_CONTEXT_SIZE];
        let bytes = &mut bytes[..C::SIZE];
        context.encode(bytes);

        self.storage.set_area(area);
        self.storage.erase()?;
        self.storage.write(bytes)?;
        self.storage.flush()?;

        let mut readback = [0u8; MAX_CONTEXT_SIZE];
        let readback = &mut readback[..C::SIZE];
        self.storage.read(0, readback)?;
        if readback != bytes {
            error!("context readback mismatch on {}", area.name);
            return Err(Error::ReadbackMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::partitions::{BootContext, Partition, SpiContext};
    use crate::hal::doubles::storage::FakeStorage;
    use pretty_assertions::assert_eq;

    const BOOTINFO: Area = Area::new("bootinfo", 0x0000, 0x1000);
    const BOOTINFO_BACKUP: Area = Area::new("bootinfob", 0x1000, 0x1000);
    const APPROM0: Area = Area::new("approm0", 0x2000, 0x1000);
    const APPROM1: Area = Area::new("approm1", 0x3000, 0x1000);

    fn manager(
        device: &FakeStorage,
    ) -> PartitionManager<FakeStorage, BootContext> {
        PartitionManager::new(device.handle(), BOOTINFO, BOOTINFO_BACKUP, [APPROM0, APPROM1])
    }

    fn flash_bank(device: &FakeStorage, area: Area, pattern: u8) -> u32 {
        use crate::hal::storage::StorageBackend;
        let mut handle = device.handle();
        handle.set_area(area);
        handle.erase().unwrap();
        handle.write(&vec![pattern; area.size as usize]).unwrap();
        handle.crc(0).unwrap()
    }

    #[test]
    fn erased_device_initializes_and_persists_a_fresh_context() {
        let device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::Initialized);
        assert_eq!(loaded.context.active, ActiveBank::None);
        assert_eq!(loaded.context.banks[0], Partition::unused(0x2000, 0x1000));
        assert_eq!(loaded.context.banks[1], Partition::unused(0x3000, 0x1000));

        // Both copies landed on flash; the next load is clean.
        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.recovery, Recovery::Clean);
        assert_eq!(reloaded.context, loaded.context);
    }

    #[test]
    fn corrupt_primary_is_restored_from_backup() {
        let mut device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        let stored = manager.load().unwrap().context;

        device.corrupt(BOOTINFO.start + 3);
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::RepairedPrimary);
        assert_eq!(loaded.context, stored);

        assert_eq!(manager.load().unwrap().recovery, Recovery::Clean);
    }

    #[test]
    fn corrupt_backup_is_restored_from_primary() {
        let mut device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        let stored = manager.load().unwrap().context;

        device.corrupt(BOOTINFO_BACKUP.start + 17);
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::RepairedBackup);
        assert_eq!(loaded.context, stored);

        assert_eq!(manager.load().unwrap().recovery, Recovery::Clean);
    }

    #[test]
    fn both_copies_corrupt_is_unrecoverable() {
        let mut device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        manager.load().unwrap();

        device.corrupt(BOOTINFO.start + 1);
        device.corrupt(BOOTINFO_BACKUP.start + 1);
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::Unrecoverable);

        // The re-initialized context is fully usable afterwards.
        assert_eq!(manager.load().unwrap().recovery, Recovery::Clean);
    }

    #[test]
    fn erased_primary_with_corrupt_backup_reinitializes() {
        use crate::hal::storage::StorageBackend;
        let mut device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        manager.load().unwrap();

        let mut eraser = device.handle();
        eraser.set_area(BOOTINFO);
        eraser.erase().unwrap();
        device.corrupt(BOOTINFO_BACKUP.start + 5);

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::Initialized);
        assert_eq!(manager.load().unwrap().recovery, Recovery::Clean);
    }

    #[test]
    fn swap_toggles_persists_and_comes_back() {
        let device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        let mut context = manager.load().unwrap().context;

        assert_eq!(manager.swap(&mut context).unwrap(), ActiveBank::Bank0);
        assert_eq!(manager.swap(&mut context).unwrap(), ActiveBank::Bank1);
        assert_eq!(manager.swap(&mut context).unwrap(), ActiveBank::Bank0);

        // What was written is what a fresh load returns.
        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.recovery, Recovery::Clean);
        assert_eq!(reloaded.context.active, ActiveBank::Bank0);
    }

    #[test]
    fn validate_partition_reports_empty_valid_and_invalid() {
        let mut device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        let mut context = manager.load().unwrap().context;

        // Untouched bank: sentinel CRC, never Invalid.
        assert_eq!(
            manager.validate_partition(&context, BankIndex::Bank0).unwrap(),
            PartitionState::Empty
        );

        let crc = flash_bank(&device, APPROM0, 0x5A);
        context.banks[0].crc32 = crc;
        assert_eq!(
            manager.validate_partition(&context, BankIndex::Bank0).unwrap(),
            PartitionState::Valid
        );

        device.corrupt(APPROM0.start + 0x123);
        assert_eq!(
            manager.validate_partition(&context, BankIndex::Bank0).unwrap(),
            PartitionState::Invalid
        );
    }

    #[test]
    fn fix_crc_heals_a_stale_descriptor() {
        let device = FakeStorage::new(0x4000);
        let mut manager = manager(&device);
        let mut context = manager.load().unwrap().context;

        // Bank flashed behind the bootloader's back: descriptor is stale.
        let crc = flash_bank(&device, APPROM1, 0xC3);
        context.banks[1].crc32 = 0x0BAD_0BAD;
        assert_eq!(
            manager.validate_partition(&context, BankIndex::Bank1).unwrap(),
            PartitionState::Invalid
        );

        let fixed = manager.fix_crc(&mut context, BankIndex::Bank1, 0).unwrap();
        assert_eq!(fixed, crc);
        assert_eq!(
            manager.validate_partition(&context, BankIndex::Bank1).unwrap(),
            PartitionState::Valid
        );

        // The healed descriptor was persisted, not just patched in RAM.
        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.context.banks[1].crc32, crc);
    }

    #[test]
    fn spi_context_manager_shares_the_same_machinery() {
        let device = FakeStorage::new(0x9000);
        let spi_banks =
            [Area::new("spi0", 0x4000, 0x2000), Area::new("spi1", 0x6000, 0x2000)];
        let mut manager: PartitionManager<FakeStorage, SpiContext> = PartitionManager::new(
            device.handle(),
            Area::new("spiinfo", 0x8000, 0x800),
            Area::new("spiinfob", 0x8800, 0x800),
            spi_banks,
        );

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.recovery, Recovery::Initialized);
        assert_eq!(loaded.context.banks[0].content_size, 0x2000);
        assert_eq!(
            manager.validate_partition(&loaded.context, BankIndex::Bank0).unwrap(),
            PartitionState::Empty
        );
    }
}
