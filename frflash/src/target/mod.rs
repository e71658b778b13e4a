//! Target families and the common flasher interface.

pub mod chip;
pub mod fr;
pub mod r32c;

pub use chip::{ChipConfig, ChipFamily, FlashReport, Flasher, Progress};
