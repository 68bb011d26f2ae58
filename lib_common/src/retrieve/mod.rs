//! # Data Retrieval Module
//!
//! This module provides a centralized location for HTTP-based interactions
//! used across the control plane: talking to the engine's local control API,
//! reading the release feed, and streaming release archives to disk.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring optional retries with exponential
//!   backoff, bearer authentication, JSON envelopes, status-only requests and
//!   streamed GETs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
