//! Cart lines, carts, and the subtotal calculation.
//!
//! A [`Cart`] can only be built from its lines, and its subtotal is derived
//! at construction time. There is no setter for either, so a cart whose
//! subtotal disagrees with its lines cannot be observed.

use serde::{Deserialize, Serialize};

use super::id::ProductId;
use super::price::{Price, PriceError};

/// Product data embedded in a cart line at fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    /// Product identifier.
    pub id: ProductId,
    /// Unit price.
    pub price: Price,
    /// Units in stock; the upper bound for the line quantity.
    pub stock: u32,
    /// Display name.
    pub name: String,
    /// Main image URL.
    pub image: Option<String>,
}

/// One product's presence in the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    /// The product as it was when the cart was fetched.
    pub product: ProductSnapshot,
    /// Units of the product in the cart.
    pub quantity: u32,
}

impl CartLine {
    /// Create a new cart line.
    #[must_use]
    pub const fn new(product: ProductSnapshot, quantity: u32) -> Self {
        Self { product, quantity }
    }

    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        &self.product.id
    }

    #[must_use]
    pub const fn unit_price(&self) -> Price {
        self.product.price
    }

    #[must_use]
    pub const fn stock_cap(&self) -> u32 {
        self.product.stock
    }

    /// Unit price times quantity.
    ///
    /// # Errors
    ///
    /// Returns `PriceError::Overflow` if the total is not representable.
    pub fn line_total(&self) -> Result<Price, PriceError> {
        self.product.price.checked_times(self.quantity)
    }
}

/// Sum of `unit_price * quantity` over `lines`.
///
/// Always recomputed from scratch; callers never adjust a previous subtotal
/// incrementally.
///
/// # Errors
///
/// Returns `PriceError::Overflow` if a line total or the sum is not
/// representable.
pub fn subtotal(lines: &[CartLine]) -> Result<Price, PriceError> {
    lines
        .iter()
        .try_fold(Price::ZERO, |total, line| total.checked_add(line.line_total()?))
}

/// Clamp a requested quantity into `[1, stock_cap]`.
///
/// Requests outside the range are not errors; they mirror the disabled +/-
/// controls in the UI. A line with no stock left clamps to 1 and the cart
/// service gets the final say.
#[must_use]
pub fn clamp_quantity(requested: i64, stock_cap: u32) -> u32 {
    let upper = stock_cap.max(1);
    u32::try_from(requested.clamp(1, i64::from(upper))).unwrap_or(upper)
}

/// An ordered sequence of cart lines with its derived subtotal.
///
/// Line order is the order the cart service reported, kept for UI stability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cart {
    lines: Vec<CartLine>,
    subtotal: Price,
}

impl Cart {
    /// Build a cart from its lines, deriving the subtotal.
    ///
    /// # Errors
    ///
    /// Returns `PriceError::Overflow` if the subtotal is not representable.
    pub fn new(lines: Vec<CartLine>) -> Result<Self, PriceError> {
        let subtotal = subtotal(&lines)?;
        Ok(Self { lines, subtotal })
    }

    /// Create an empty cart.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            lines: Vec::new(),
            subtotal: Price::ZERO,
        }
    }

    #[must_use]
    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    #[must_use]
    pub const fn subtotal(&self) -> Price {
        self.subtotal
    }

    /// Find the line for a product.
    #[must_use]
    pub fn line(&self, product_id: &ProductId) -> Option<&CartLine> {
        self.lines.iter().find(|line| line.product_id() == product_id)
    }

    #[must_use]
    pub fn contains(&self, product_id: &ProductId) -> bool {
        self.line(product_id).is_some()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Total units across all lines (the cart badge count).
    #[must_use]
    pub fn item_count(&self) -> u32 {
        self.lines
            .iter()
            .map(|line| line.quantity)
            .fold(0, u32::saturating_add)
    }
}

impl Default for Cart {
    fn default() -> Self {
        Self::empty()
    }
}

impl TryFrom<Vec<CartLine>> for Cart {
    type Error = PriceError;

    fn try_from(lines: Vec<CartLine>) -> Result<Self, Self::Error> {
        Self::new(lines)
    }
}
