//! # Utilities Module
//!
//! General-purpose helpers shared across the workspace that do not belong to
//! a more specific module.
//!
//! ## Contained Modules:
//!
//! - **`misc`**: host platform helpers in `sys_info` (executable naming,
//!   release platform tags, stray process sweeps).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Miscellaneous host helpers.
pub mod misc;
