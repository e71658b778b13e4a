//! Protocol building blocks shared by all target families.
//!
//! Family-specific command sets live next to their flashers under
//! [`crate::target`].

pub mod link;

pub use link::ByteLink;
