//! Core domain + application logic for the Telegram-controlled WhatsApp bot manager.
//!
//! This crate is intentionally framework-agnostic. Telegram, the WhatsApp protocol
//! sidecar and image hosting live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod connection;
pub mod control;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod media;
pub mod messaging;
pub mod notifier;
pub mod persist;
pub mod replies;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod tenant;
pub mod utils;

pub use errors::{ControlError, Error, Result};
