//! In-memory mirror of the authoritative cart.
//!
//! Every operation computes the next [`Cart`] in full and swaps it in under
//! the write lock, so a reader sees either the previous cart or the next one,
//! never lines and a subtotal from different moments. Snapshots are
//! `Arc<Cart>`: cheap to hand out and unaffected by later writes.
//!
//! Only the mutation coordinator and the load path should hold a writable
//! handle; UI code reads through [`LocalCartCache::snapshot`].

use std::sync::{Arc, PoisonError, RwLock};

use cartwheel_core::{Cart, CartLine, ProductId, ProductSnapshot, clamp_quantity};
use tracing::debug;

use crate::error::CartError;

/// A line's state before an optimistic write, kept for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorState {
    /// The product was not in the cart.
    Absent,
    /// The line as it was, and its index in the cart.
    Present { line: CartLine, position: usize },
}

impl PriorState {
    /// The prior quantity, if the line existed.
    #[must_use]
    pub const fn quantity(&self) -> Option<u32> {
        match self {
            Self::Absent => None,
            Self::Present { line, .. } => Some(line.quantity),
        }
    }
}

/// Cloneable handle to the shared cart cache.
#[derive(Clone, Default)]
pub struct LocalCartCache {
    inner: Arc<RwLock<Arc<Cart>>>,
}

impl std::fmt::Debug for LocalCartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCartCache")
            .field("cart", &self.snapshot())
            .finish()
    }
}

impl LocalCartCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable view of the current cart.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Cart> {
        // Writers only ever swap a whole `Arc<Cart>`, so a poisoned lock
        // still holds a consistent cart.
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the entire cart. Nothing from the previous cart survives.
    pub fn load(&self, cart: Cart) {
        debug!(lines = cart.lines().len(), "Loading cart");
        self.replace(cart);
    }

    /// Discard the cart (logout).
    pub fn clear(&self) {
        self.replace(Cart::empty());
    }

    /// Set the quantity of an existing line, clamped to `[1, stock]`.
    ///
    /// # Errors
    ///
    /// Returns `CartError::NotFound` if the product is not in the cart, or
    /// `CartError::OutOfRange` if the new subtotal is not representable.
    pub fn apply_quantity(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<PriorState, CartError> {
        self.try_update(|lines| {
            let position = position_of(lines, product_id)
                .ok_or_else(|| CartError::NotFound(product_id.clone()))?;
            Ok(set_quantity_at(lines, position, quantity))
        })
    }

    /// Set the quantity of a product, inserting a line at the end if the
    /// product is not in the cart yet.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OutOfRange` if the new subtotal is not
    /// representable.
    pub fn upsert(
        &self,
        product: ProductSnapshot,
        quantity: i64,
    ) -> Result<PriorState, CartError> {
        self.try_update(|lines| match position_of(lines, &product.id) {
            Some(position) => Ok(set_quantity_at(lines, position, quantity)),
            None => {
                let quantity = clamp_quantity(quantity, product.stock);
                lines.push(CartLine::new(product, quantity));
                Ok(PriorState::Absent)
            }
        })
    }

    /// Remove a line. Removing a missing product is a no-op returning
    /// `PriorState::Absent`.
    ///
    /// # Errors
    ///
    /// Only fails if the remaining subtotal is not representable, which a
    /// previously published cart rules out.
    pub fn remove(&self, product_id: &ProductId) -> Result<PriorState, CartError> {
        self.try_update(|lines| match position_of(lines, product_id) {
            Some(position) => {
                let line = lines.remove(position);
                Ok(PriorState::Present { line, position })
            }
            None => Ok(PriorState::Absent),
        })
    }

    /// Put a line back the way it was before an optimistic write.
    ///
    /// A removed line is reinserted at its old position (or at the end if the
    /// cart has since shrunk). Restoring `Absent` removes the line.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OutOfRange` if the restored line no longer fits
    /// the subtotal. The cart is left as it was.
    pub fn restore(&self, product_id: &ProductId, prior: PriorState) -> Result<(), CartError> {
        match prior {
            PriorState::Absent => self.remove(product_id).map(drop),
            PriorState::Present { line, position } => self.try_update(|lines| {
                match position_of(lines, product_id) {
                    Some(current) => {
                        if let Some(slot) = lines.get_mut(current) {
                            *slot = line;
                        }
                    }
                    None => lines.insert(position.min(lines.len()), line),
                }
                Ok(())
            }),
        }
    }

    /// Run `mutate` against a copy of the lines and publish the result as
    /// the new cart. Nothing is published if `mutate` fails or the new
    /// subtotal is not representable.
    fn try_update<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<CartLine>) -> Result<T, CartError>,
    ) -> Result<T, CartError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut lines = guard.lines().to_vec();
        let result = mutate(&mut lines)?;
        *guard = Arc::new(Cart::new(lines)?);
        Ok(result)
    }

    fn replace(&self, cart: Cart) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(cart);
    }
}

fn position_of(lines: &[CartLine], product_id: &ProductId) -> Option<usize> {
    lines.iter().position(|line| line.product_id() == product_id)
}

fn set_quantity_at(lines: &mut [CartLine], position: usize, quantity: i64) -> PriorState {
    match lines.get_mut(position) {
        Some(line) => {
            let prior = PriorState::Present {
                line: line.clone(),
                position,
            };
            line.quantity = clamp_quantity(quantity, line.stock_cap());
            prior
        }
        None => PriorState::Absent,
    }
}
