//! Cartwheel storefront cart library.
//!
//! Keeps a local shopping cart in sync with a remote cart service. Edits
//! show up immediately and are reconciled (or rolled back) once the service
//! answers.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod cart;
pub mod config;
pub mod credentials;
pub mod error;

pub use cart::{CartEvent, CartGateway, HttpCartGateway, LocalCartCache, MutationCoordinator};
pub use config::{CartApiConfig, ConfigError, StorefrontConfig, SyncConfig};
pub use credentials::CredentialStore;
pub use error::CartError;
