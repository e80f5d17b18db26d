//! Glob import of the operation traits.
//!
//! `use flashcomm::prelude::*;` makes `read`, `write_bytes` and the erase
//! methods callable on a [`Flash`](crate::Flash) without naming the traits.

pub use crate::BlockDevice as _;
pub use crate::Read as _;
