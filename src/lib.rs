//! # Ballast
//!
//! Dual-bank firmware update transport and boot management core.
//!
//! This crate contains the device and host halves of a block transfer
//! protocol used to push firmware images (or FPGA bitstreams) over an
//! unreliable byte transport, together with the partition manager that
//! keeps two redundant copies of the boot metadata consistent across
//! power loss. Board bring-up, peripheral drivers and the surrounding
//! boot loop live outside this crate; they talk to it through the
//! interfaces in [`hal`] and the outcomes returned by the session
//! driver.
#![cfg_attr(target_arch = "arm", no_std)]

#[macro_use]
pub mod utilities {
    mod macros;
}

pub mod hal;
pub mod devices;
pub mod drivers;
pub mod error;
