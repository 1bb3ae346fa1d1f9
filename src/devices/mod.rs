//! Business logic of the bootloader core, generic over the abstract
//! storage and transport interfaces. Board specifics (pins, memory maps,
//! the actual boot jump) are the caller's concern.

pub mod bootloader;
pub mod partitions;
pub mod protocol;
pub mod session;

/// General purpose traits that summarize requirements on devices.
pub mod traits {
    use crate::error::Convertible;
    use crate::hal::{storage::StorageBackend, transport::TransportDriver};
    use marker_blanket::marker_blanket;

    /// A supported storage backend must report errors the session driver
    /// and partition manager can surface.
    #[marker_blanket]
    pub trait Storage: StorageBackend<Error: Convertible> {}

    /// A supported transport must report errors the session driver can
    /// surface.
    #[marker_blanket]
    pub trait Transport: TransportDriver<Error: Convertible> {}
}
