use crate::error::{Convertible, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeStorageError(pub &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeTransportError(pub &'static str);

impl Convertible for FakeStorageError {
    fn into(self) -> Error {
        Error::Storage(self.0)
    }
}

impl Convertible for FakeTransportError {
    fn into(self) -> Error {
        Error::Transport(self.0)
    }
}
