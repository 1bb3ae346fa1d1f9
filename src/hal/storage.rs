//! Abstract byte-addressable storage, bound to a named area before use.

/// A named storage region. Areas are fixed at construction time (bank
/// locations come out of the memory map or the persisted descriptors) and
/// are cheap to copy around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Area {
    pub name: &'static str,
    pub start: u32,
    pub size: u32,
}

impl Area {
    pub const fn new(name: &'static str, start: u32, size: u32) -> Self {
        Self { name, start, size }
    }

    /// First address past the area.
    pub const fn end(&self) -> u32 {
        self.start + self.size
    }
}

/// Backend for a single storage device (internal flash, SPI flash, or an
/// in-memory double). One backend serves multiple areas, but only the
/// area selected through [`set_area`](StorageBackend::set_area) at a
/// given moment.
///
/// Reads take an explicit offset relative to the area start. Writes are
/// sequential: each call appends at an internal cursor that starts at
/// zero when an area is selected and is reset by
/// [`flush`](StorageBackend::flush), which reports how many bytes were
/// written since.
pub trait StorageBackend {
    type Error: Copy + Clone + core::fmt::Debug;

    fn init(&mut self) -> Result<(), Self::Error>;

    /// Selects the area targeted by subsequent calls and resets the
    /// write cursor.
    fn set_area(&mut self, area: Area);

    /// Currently selected area, if any.
    fn area(&self) -> Option<Area>;

    /// Reads `bytes.len()` bytes starting `offset` bytes into the area.
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;

    /// Appends `bytes` at the write cursor and advances it.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Erases the whole selected area.
    fn erase(&mut self) -> Result<(), Self::Error>;

    /// Resets the write cursor, returning the number of bytes written
    /// since the area was selected or last flushed.
    fn flush(&mut self) -> Result<u32, Self::Error>;

    /// CRC32 over the first `length` bytes of the area, or over the
    /// whole area when `length` is zero.
    fn crc(&mut self, length: u32) -> Result<u32, Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error>;
}
