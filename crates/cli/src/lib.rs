//! abus command-line front end
//!
//! The binary in `main.rs` is a thin dispatcher; everything it runs lives
//! here so integration tests can reach it.

pub mod cmd;
pub mod locks;
pub mod logging;
pub mod settings;
pub mod util;
