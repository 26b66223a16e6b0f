//! Core domain + compliance logic for the group activity warden.
//!
//! This crate is intentionally framework-agnostic. Telegram and SQLite live
//! behind ports (traits) implemented in adapter crates.

pub mod audit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod ports;
pub mod signals;

pub use errors::{Error, Result};
