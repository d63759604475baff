//! Remote cart service access.
//!
//! Each call is exactly one HTTP request. There is no retry and no caching
//! here; resilience policy belongs to the coordinator and its callers.
//!
//! # Endpoints
//!
//! - `GET /cart` - the authoritative cart
//! - `POST /cart/item/{productId}` with `{ "quantity": n }` - upsert a line,
//!   answers with the recomputed cart
//! - `DELETE /cart/item/{productId}` - remove a line

use std::future::Future;

use cartwheel_core::{Cart, ProductId};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tracing::{debug, error, instrument, warn};
use url::Url;

use super::wire::{QuantityBody, decode_cart};
use crate::config::CartApiConfig;
use crate::credentials::CredentialStore;
use crate::error::CartError;

/// Maximum number of body characters copied into logs and error messages.
const BODY_LOG_LIMIT: usize = 500;

/// The remote cart service as seen by the coordinator.
pub trait CartGateway: Send + Sync + 'static {
    /// Fetch the authoritative cart.
    fn fetch(&self) -> impl Future<Output = Result<Cart, CartError>> + Send;

    /// Set a product's quantity (inserting the line if needed) and return
    /// the recomputed cart.
    fn update_item(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> impl Future<Output = Result<Cart, CartError>> + Send;

    /// Remove a product's line. Removing a missing line succeeds.
    fn delete_item(
        &self,
        product_id: &ProductId,
    ) -> impl Future<Output = Result<(), CartError>> + Send;
}

/// `reqwest`-backed [`CartGateway`].
#[derive(Clone)]
pub struct HttpCartGateway {
    client: reqwest::Client,
    base_url: Url,
    credentials: CredentialStore,
}

impl std::fmt::Debug for HttpCartGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCartGateway")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpCartGateway {
    /// Create a gateway for the configured cart service.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (e.g. the TLS
    /// backend fails to initialize).
    pub fn new(config: &CartApiConfig, credentials: CredentialStore) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            credentials,
        })
    }

    /// The credential slot this gateway reads from.
    #[must_use]
    pub const fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Resolve `segments` below the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn item_endpoint(&self, product_id: &ProductId) -> Url {
        self.endpoint(&["cart", "item", product_id.as_str()])
    }

    /// Send a request with the bearer credential attached.
    ///
    /// Returns the status and body of any response; only transport-level
    /// failures and a missing credential are errors here.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), CartError> {
        let token = self.credentials.bearer().await?;

        let response = request.bearer_auth(token.expose_secret()).send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok((status, body))
    }
}

impl CartGateway for HttpCartGateway {
    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<Cart, CartError> {
        let request = self.client.get(self.endpoint(&["cart"]));
        let (status, body) = self.send(request).await?;

        check_status(status, &body)?;
        parse_cart(&body)
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn update_item(&self, product_id: &ProductId, quantity: u32) -> Result<Cart, CartError> {
        let request = self
            .client
            .post(self.item_endpoint(product_id))
            .json(&QuantityBody { quantity });
        let (status, body) = self.send(request).await?;

        if status == StatusCode::NOT_FOUND {
            debug!("Product is no longer orderable");
            return Err(CartError::NotFound(product_id.clone()));
        }
        check_status(status, &body)?;
        parse_cart(&body)
    }

    #[instrument(skip(self), fields(product_id = %product_id))]
    async fn delete_item(&self, product_id: &ProductId) -> Result<(), CartError> {
        let request = self.client.delete(self.item_endpoint(product_id));
        let (status, body) = self.send(request).await?;

        if status == StatusCode::NOT_FOUND {
            debug!("Line already absent, treating delete as done");
            return Ok(());
        }
        check_status(status, &body)
    }
}

/// Map a non-success status to the error taxonomy.
fn check_status(status: StatusCode, body: &str) -> Result<(), CartError> {
    if status.is_success() {
        return Ok(());
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        warn!(status = %status, "Cart service rejected credential");
        return Err(CartError::Unauthorized);
    }

    let excerpt: String = body.chars().take(BODY_LOG_LIMIT).collect();
    error!(
        status = %status,
        body = %excerpt,
        "Cart service returned non-success status"
    );
    Err(CartError::Unavailable(format!("HTTP {status}")))
}

fn parse_cart(body: &str) -> Result<Cart, CartError> {
    decode_cart(body).map_err(|e| {
        error!(
            error = %e,
            body = %body.chars().take(BODY_LOG_LIMIT).collect::<String>(),
            "Failed to parse cart response"
        );
        CartError::Unavailable(format!("invalid cart payload: {e}"))
    })
}
