//! FR series support.

pub mod flasher;
pub mod protocol;

pub use flasher::FrFlasher;
