//! Cart service payloads and their conversion into core types.
//!
//! The service answers either with the bare cart document or with the cart
//! wrapped in its standard `{ "statusCode", "data", "message", "success" }`
//! envelope. Both shapes are accepted.

use cartwheel_core::{
    Cart, CartLine, Price, PriceError, ProductId, ProductSnapshot, clamp_quantity,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Why a response body could not become a [`Cart`].
#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("line for {0} has zero quantity")]
    ZeroQuantity(String),

    #[error("cart subtotal: {0}")]
    Subtotal(#[from] PriceError),
}

/// Either an enveloped or a bare response body.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    pub(crate) fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } | Self::Bare(data) => data,
        }
    }
}

/// `GET /cart` and `POST /cart/item/{id}` response document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CartPayload {
    pub items: Vec<CartItemPayload>,
    pub cart_total: Option<Price>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CartItemPayload {
    pub product: ProductPayload,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProductPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub price: Price,
    pub stock: u32,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "image")]
    pub main_image: Option<ImagePayload>,
}

/// Images arrive either as a bare URL or as an uploaded-asset object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ImagePayload {
    Url(String),
    Asset { url: String },
}

/// `POST /cart/item/{id}` request body.
#[derive(Debug, Serialize)]
pub(crate) struct QuantityBody {
    pub quantity: u32,
}

// =============================================================================
// Type Conversions
// =============================================================================

impl From<ProductPayload> for ProductSnapshot {
    fn from(product: ProductPayload) -> Self {
        Self {
            id: ProductId::new(product.id),
            price: product.price,
            stock: product.stock,
            name: product.name,
            image: product.main_image.map(|image| match image {
                ImagePayload::Url(url) | ImagePayload::Asset { url } => url,
            }),
        }
    }
}

impl TryFrom<CartItemPayload> for CartLine {
    type Error = DecodeError;

    fn try_from(item: CartItemPayload) -> Result<Self, Self::Error> {
        if item.quantity == 0 {
            return Err(DecodeError::ZeroQuantity(item.product.id));
        }
        let product = ProductSnapshot::from(item.product);
        let quantity = clamp_quantity(i64::from(item.quantity), product.stock);
        if quantity != item.quantity {
            warn!(
                product_id = %product.id,
                reported = item.quantity,
                stock = product.stock,
                "Cart service quantity exceeds stock, clamping"
            );
        }
        Ok(Self::new(product, quantity))
    }
}

impl TryFrom<CartPayload> for Cart {
    type Error = DecodeError;

    fn try_from(payload: CartPayload) -> Result<Self, Self::Error> {
        let reported_total = payload.cart_total;
        let lines = payload
            .items
            .into_iter()
            .map(CartLine::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let cart = Self::new(lines)?;

        // The derived subtotal is what gets displayed; a differing server
        // total usually means discounts were applied server-side.
        if let Some(total) = reported_total
            && total != cart.subtotal()
        {
            warn!(
                reported = %total,
                derived = %cart.subtotal(),
                "Cart service total disagrees with derived subtotal"
            );
        }

        Ok(cart)
    }
}

/// Decode a cart response body.
pub(crate) fn decode_cart(body: &str) -> Result<Cart, DecodeError> {
    let envelope: Envelope<CartPayload> = serde_json::from_str(body)?;
    Cart::try_from(envelope.into_inner())
}
