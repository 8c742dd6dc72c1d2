//! Rig Common Library
//!
//! Shared constants, capability traits, configuration loading and the
//! outbound message model for the rig workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - System-wide numeric limits and defaults
//! - [`config`] - TOML configuration loading and validation
//! - [`error`] - The workspace error taxonomy
//! - [`io`] - Capability traits the engine consumes (channel I/O, lamps, clocks)
//! - [`report`] - Structured outbound messages and the best-effort sink trait

pub mod config;
pub mod consts;
pub mod error;
pub mod io;
pub mod report;
