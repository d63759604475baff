//! Cart error taxonomy.
//!
//! Every gateway failure is mapped into one of three kinds. A fourth,
//! [`CartError::OutOfRange`], is raised locally when a write would make the
//! subtotal unrepresentable. The coordinator rolls back any optimistic write
//! before a `CartError` reaches a caller.

use cartwheel_core::{PriceError, ProductId};
use thiserror::Error;

/// Errors surfaced by the cart subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    /// Credential missing or expired. Never retried here; the auth
    /// collaborator is responsible for re-authentication.
    #[error("Unauthorized: cart credential missing or expired")]
    Unauthorized,

    /// The referenced line does not exist (locally or server-side).
    #[error("Not found: {0}")]
    NotFound(ProductId),

    /// Transient network or server failure, including timeouts.
    #[error("Cart service unavailable: {0}")]
    Unavailable(String),

    /// The write was refused before reaching the cart service.
    #[error("Cart total out of range: {0}")]
    OutOfRange(PriceError),
}

impl CartError {
    /// Whether a caller may reasonably retry the same request later.
    ///
    /// The subsystem itself never retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for CartError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable("request timed out".to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<PriceError> for CartError {
    fn from(err: PriceError) -> Self {
        Self::OutOfRange(err)
    }
}
