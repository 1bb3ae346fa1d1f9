//! Storage backend over any `embedded-storage` NOR flash device.

use crate::error::{Convertible, Error};
use crate::hal::storage::{Area, StorageBackend};
use crc::{crc32, Hasher32};
use embedded_storage::nor_flash::NorFlash;

/// Scratch used for CRC runs and write padding. Large enough for the
/// program granularity of the flash parts this crate targets.
const CHUNK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NorFlashStorageError {
    NoAreaSelected,
    OutOfBounds,
    /// Program granularity larger than the driver's scratch buffer.
    UnsupportedWriteSize,
    Flash,
}

impl Convertible for NorFlashStorageError {
    fn into(self) -> Error {
        Error::Storage(match self {
            NorFlashStorageError::NoAreaSelected => "no area selected",
            NorFlashStorageError::OutOfBounds => "access outside the selected area",
            NorFlashStorageError::UnsupportedWriteSize => "unsupported flash write granularity",
            NorFlashStorageError::Flash => "nor flash operation failed",
        })
    }
}

/// Adapts a [`NorFlash`] device to the area-and-cursor storage contract.
///
/// Areas must be aligned to the device's erase granularity. Writes are
/// padded with the erased byte up to the program granularity, so only
/// the final write of a transfer may have an unaligned length.
pub struct NorFlashStorage<F: NorFlash> {
    flash: F,
    area: Option<Area>,
    cursor: u32,
}

impl<F: NorFlash> NorFlashStorage<F> {
    pub fn new(flash: F) -> Self {
        NorFlashStorage { flash, area: None, cursor: 0 }
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn selected(&self) -> Result<Area, NorFlashStorageError> {
        self.area.ok_or(NorFlashStorageError::NoAreaSelected)
    }
}

impl<F: NorFlash> StorageBackend for NorFlashStorage<F> {
    type Error = NorFlashStorageError;

    fn init(&mut self) -> Result<(), Self::Error> {
        if F::WRITE_SIZE > CHUNK_SIZE {
            return Err(NorFlashStorageError::UnsupportedWriteSize);
        }
        Ok(())
    }

    fn set_area(&mut self, area: Area) {
        debug!("selecting area {} at {:x}", area.name, area.start);
        self.area = Some(area);
        self.cursor = 0;
    }

    fn area(&self) -> Option<Area> {
        self.area
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let area = self.selected()?;
        if offset as usize + bytes.len() > area.size as usize {
            return Err(NorFlashStorageError::OutOfBounds);
        }
        self.flash.read(area.start + offset, bytes).map_err(|_| NorFlashStorageError::Flash)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let area = self.selected()?;
        if self.cursor as usize + bytes.len() > area.size as usize {
            return Err(NorFlashStorageError::OutOfBounds);
        }
        let offset = area.start + self.cursor;

        let aligned = bytes.len() - bytes.len() % F::WRITE_SIZE;
        if aligned > 0 {
            self.flash
                .write(offset, &bytes[..aligned])
                .map_err(|_| NorFlashStorageError::Flash)?;
        }

        let tail = &bytes[aligned..];
        if !tail.is_empty() {
            // Pad the final short write up to the program granularity.
            let mut padded = [0xFFu8; CHUNK_SIZE];
            padded[..tail.len()].copy_from_slice(tail);
            self.flash
                .write(offset + aligned as u32, &padded[..F::WRITE_SIZE])
                .map_err(|_| NorFlashStorageError::Flash)?;
        }

        self.cursor += bytes.len() as u32;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), Self::Error> {
        let area = self.selected()?;
        info!("erasing area {} ({} bytes)", area.name, area.size);
        self.flash.erase(area.start, area.end()).map_err(|_| NorFlashStorageError::Flash)
    }

    fn flush(&mut self) -> Result<u32, Self::Error> {
        let written = self.cursor;
        self.cursor = 0;
        Ok(written)
    }

    fn crc(&mut self, length: u32) -> Result<u32, Self::Error> {
        let area = self.selected()?;
        let length = if length == 0 { area.size } else { length };
        if length > area.size {
            return Err(NorFlashStorageError::OutOfBounds);
        }

        let mut digest = crc32::Digest::new(crc32::IEEE);
        let mut chunk = [0u8; CHUNK_SIZE];
        let mut position = 0u32;
        while position < length {
            let step = CHUNK_SIZE.min((length - position) as usize);
            self.flash
                .read(area.start + position, &mut chunk[..step])
                .map_err(|_| NorFlashStorageError::Flash)?;
            digest.write(&chunk[..step]);
            position += step as u32;
        }
        Ok(digest.sum32())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.area = None;
        Ok(())
    }
}
