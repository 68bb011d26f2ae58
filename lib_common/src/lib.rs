//! # lib_common
//!
//! Shared building blocks for the engine control plane. Each top-level module
//! sits behind a cargo feature of the same name so that consumers only pull in
//! the dependencies they actually use.

#![forbid(unsafe_code)]

/// Console and file logging built on `fern`.
#[cfg(feature = "loggers")]
pub mod loggers;
/// HTTP clients with retry middleware and streamed downloads.
#[cfg(feature = "retrieve")]
pub mod retrieve;
/// Host platform helpers (executable names, platform tags, process sweeps).
#[cfg(feature = "utils")]
pub mod utils;
