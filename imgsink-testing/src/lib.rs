//! Testing helpers for use writing unit and integration tests of the `imgsink` crate
//!
//! This is internal to `imgsink` and is not intended for use by any other crates.  Breaking
//! changes can be made at any time.
pub mod certs;
pub mod logging;
pub mod tar;

/// Test code that reports errors can just cheat and use `eyre`
pub type Result<T> = color_eyre::Result<T>;
