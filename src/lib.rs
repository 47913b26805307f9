//! macrorelay — session-authenticated relay for home-automation macro
//! triggers.
//!
//! Users own devices, devices expose macros, and an authorized invocation is
//! proxied one-shot to the external trigger service. See the `gateway`
//! module for the HTTP surface and `store` for the persistence layer.

pub mod access;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;
pub mod trigger;
