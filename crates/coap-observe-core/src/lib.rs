//! # coap-observe-core
//!
//! Core model for the observable clock resource.
//!
//! This crate provides:
//! - The resource mode (elapsed time or tick count) and a shared mode cell
//! - The payload source used for every notification and one-shot read
//! - Server settings loaded from a JSON file
//!
//! This crate is intentionally runtime-agnostic and contains no async code.

pub mod config;
pub mod mode;
pub mod resource;

pub use config::{ConfigError, ServerSettings};
pub use mode::{ModeCell, ResourceMode};
pub use resource::current_payload;
