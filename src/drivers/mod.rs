//! Concrete storage and transport backends, adapting ecosystem traits
//! to the interfaces in [`crate::hal`].

pub mod nor_flash;
pub mod serial;

#[cfg(not(target_arch = "arm"))]
pub mod udp;
