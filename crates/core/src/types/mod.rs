//! Core types for Cartwheel.
//!
//! This module provides type-safe wrappers for cart domain concepts.

pub mod cart;
pub mod id;
pub mod price;

pub use cart::{Cart, CartLine, ProductSnapshot, clamp_quantity, subtotal};
pub use id::ProductId;
pub use price::{Price, PriceError};
