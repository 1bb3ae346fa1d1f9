use super::error::FakeStorageError;
use crate::hal::storage::{Area, StorageBackend};
use crc::{crc32, Hasher32};
use std::{cell::RefCell, rc::Rc};

const ERASED: u8 = 0xFF;

/// Vec-backed storage device. Several handles may share the same
/// underlying memory (one for the partition manager, one for the session
/// driver), each with its own selected area and write cursor.
pub struct FakeStorage {
    memory: Rc<RefCell<Vec<u8>>>,
    area: Option<Area>,
    cursor: u32,
}

impl FakeStorage {
    pub fn new(size: usize) -> FakeStorage {
        FakeStorage { memory: Rc::new(RefCell::new(vec![ERASED; size])), area: None, cursor: 0 }
    }

    /// Another handle over the same memory, with no area selected.
    pub fn handle(&self) -> FakeStorage {
        FakeStorage { memory: Rc::clone(&self.memory), area: None, cursor: 0 }
    }

    /// Test hook: flip one byte at an absolute address.
    pub fn corrupt(&mut self, address: u32) {
        let mut memory = self.memory.borrow_mut();
        memory[address as usize] ^= 0xA5;
    }

    /// Test hook: copy out raw device contents at an absolute address.
    pub fn snapshot(&self, address: u32, length: usize) -> Vec<u8> {
        let memory = self.memory.borrow();
        memory[address as usize..address as usize + length].to_vec()
    }

    fn selected(&self) -> Result<Area, FakeStorageError> {
        self.area.ok_or(FakeStorageError("no area selected"))
    }
}

impl StorageBackend for FakeStorage {
    type Error = FakeStorageError;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_area(&mut self, area: Area) {
        self.area = Some(area);
        self.cursor = 0;
    }

    fn area(&self) -> Option<Area> {
        self.area
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let area = self.selected()?;
        if offset as usize + bytes.len() > area.size as usize {
            return Err(FakeStorageError("read past end of area"));
        }
        let from = (area.start + offset) as usize;
        let memory = self.memory.borrow();
        bytes.copy_from_slice(&memory[from..from + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let area = self.selected()?;
        if self.cursor as usize + bytes.len() > area.size as usize {
            return Err(FakeStorageError("write past end of area"));
        }
        let from = (area.start + self.cursor) as usize;
        self.memory.borrow_mut()[from..from + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len() as u32;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), Self::Error> {
        let area = self.selected()?;
        let mut memory = self.memory.borrow_mut();
        memory[area.start as usize..area.end() as usize].fill(ERASED);
        Ok(())
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
            return Err(FakeStorageError("crc length past end of area"));
        }
        let memory = self.memory.borrow();
        let from = area.start as usize;
        let mut digest = crc32::Digest::new(crc32::IEEE);
        digest.write(&memory[from..from + length as usize]);
        Ok(digest.sum32())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.area = None;
        Ok(())
    }
}
