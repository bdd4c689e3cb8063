//! Slumbertale backend library modules.
//!
//! The crate follows a ports-and-adapters layout: `domain` holds entities,
//! ports, and services; `outbound` holds persistence, provider, and blob
//! adapters; `inbound` holds the HTTP adapter; `server` wires them together.

pub mod doc;
pub mod domain;
pub mod inbound;
pub mod outbound;
pub mod server;
pub mod test_support;

pub use domain::{Error, ErrorCode};
