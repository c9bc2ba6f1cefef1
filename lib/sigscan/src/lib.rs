//!
//! @file lib.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Compiles fuzzy byte signatures and scans memory ranges for them.
//! @bug No known bugs.
//!
//! A signature is authored as a string of space separated tokens, where each
//! token is either a two digit hex byte or a single-byte wildcard ("?" and
//! "??" are the same wildcard). Compilation produces a byte sequence and an
//! inclusion mask of equal length; scanning returns the lowest offset in the
//! searched range whose bytes agree with the signature at every non-wildcard
//! position.
//!

mod pattern;
mod scan;

pub use pattern::{Pattern, PatternError};
