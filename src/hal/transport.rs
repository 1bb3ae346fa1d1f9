//! Abstract packet transport towards the host tool (or the device, when
//! this crate runs on the host side).

/// Byte transport carrying whole protocol frames.
///
/// `read` blocks until one frame is available and returns its length; a
/// return of zero means a spurious empty frame, which callers may retry
/// exactly once before treating the link as broken. Implementations must
/// preserve frame boundaries — one datagram, or one idle-line delimited
/// burst, per call.
pub trait TransportDriver {
    type Error: Copy + Clone + core::fmt::Debug;

    fn init(&mut self) -> Result<(), Self::Error>;

    /// Sends one frame, returning the number of bytes written.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, Self::Error>;

    /// Receives one frame into `buffer`, returning its length.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    fn close(&mut self);
}
