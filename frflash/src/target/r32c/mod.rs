//! R32C series support.

pub mod flasher;
pub mod protocol;

pub use flasher::R32cFlasher;
