//! Cart synchronization.
//!
//! [`LocalCartCache`] holds what the UI renders. [`MutationCoordinator`]
//! writes to it optimistically and reconciles with the remote cart service
//! through a [`CartGateway`].

mod cache;
mod coordinator;
mod events;
mod gateway;
mod wire;

pub use cache::{LocalCartCache, PriorState};
pub use coordinator::{
    MutationCoordinator, MutationOutcome, MutationStatus, MutationTarget, MutationTicket,
    PendingMutation, RefreshOutcome,
};
pub use events::{CartEvent, EventKind};
pub use gateway::{CartGateway, HttpCartGateway};
