//! Cartwheel Core - Shared types library.
//!
//! This crate provides the types used across all Cartwheel components:
//! - `storefront` - Cart synchronization against the remote cart service
//! - `cli` - Command-line storefront client
//!
//! # Architecture
//!
//! The core crate contains only types and pure functions - no I/O, no HTTP
//! clients, no locks. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Product IDs, prices, cart lines, and the subtotal calculation

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
