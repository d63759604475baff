//! Notifications for UI observers.
//!
//! Delivered over a `tokio::sync::broadcast` channel. Sending never blocks
//! the coordinator; a receiver that falls behind sees `Lagged` and should
//! re-read the cache snapshot.

use cartwheel_core::ProductId;
use serde::Serialize;

use crate::error::CartError;

/// Something observable happened to the cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartEvent {
    /// An optimistic write is visible in the cache.
    Optimistic {
        product_id: ProductId,
        request_id: u64,
    },
    /// The cart service accepted the current request for a product.
    Committed {
        product_id: ProductId,
        request_id: u64,
    },
    /// A response arrived for a superseded request and was ignored.
    Discarded {
        product_id: ProductId,
        request_id: u64,
    },
    /// The optimistic write was undone after the cart service refused it.
    RolledBack {
        product_id: ProductId,
        request_id: u64,
        error: CartError,
    },
    /// The cache was replaced with the authoritative cart.
    Reloaded,
    /// The cart service rejected the credential.
    SessionExpired,
}

impl CartEvent {
    /// Short machine-readable name, used in logs and JSON output.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Optimistic { .. } => EventKind::Optimistic,
            Self::Committed { .. } => EventKind::Committed,
            Self::Discarded { .. } => EventKind::Discarded,
            Self::RolledBack { .. } => EventKind::RolledBack,
            Self::Reloaded => EventKind::Reloaded,
            Self::SessionExpired => EventKind::SessionExpired,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Optimistic,
    Committed,
    Discarded,
    RolledBack,
    Reloaded,
    SessionExpired,
}
