//! Cart commands.
//!
//! Every command loads the authoritative cart first, so a mutation always
//! starts from what the service currently holds.
//!
//! # Environment Variables
//!
//! - `CART_API_TOKEN` - Bearer credential (required)
//! - `CART_API_BASE_URL` - Cart service base URL

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use cartwheel_core::{Cart, Price, ProductId, ProductSnapshot};
use cartwheel_storefront::cart::{CartEvent, EventKind, MutationTicket};
use cartwheel_storefront::{
    CartError, CredentialStore, HttpCartGateway, LocalCartCache, MutationCoordinator,
    StorefrontConfig,
};

/// Errors that can occur while running a cart command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No bearer credential configured.
    #[error("Missing environment variable: CART_API_TOKEN")]
    MissingToken,

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// The cart service refused or failed the operation.
    #[error(transparent)]
    Cart(#[from] CartError),

    /// JSON output failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A loaded cart plus the coordinator that edits it.
pub struct Session {
    coordinator: MutationCoordinator<HttpCartGateway>,
    events: broadcast::Receiver<CartEvent>,
}

/// `show --json` document.
#[derive(Serialize)]
struct CartReport<'a> {
    cart: &'a Cart,
    events: Vec<EventKind>,
}

impl CommandError {
    /// Whether the error means the credential must be replaced.
    #[must_use]
    pub const fn needs_login(&self) -> bool {
        matches!(
            self,
            Self::MissingToken | Self::Cart(CartError::Unauthorized)
        )
    }
}

impl Session {
    /// Build the client stack and load the cart.
    pub async fn connect(config: &StorefrontConfig) -> Result<Self, CommandError> {
        let token = config
            .cart_api
            .token
            .clone()
            .ok_or(CommandError::MissingToken)?;

        let gateway = HttpCartGateway::new(&config.cart_api, CredentialStore::with_token(token))?;
        let coordinator = MutationCoordinator::new(gateway, LocalCartCache::new(), config.sync);
        let events = coordinator.subscribe();

        coordinator.refresh().await?;
        tracing::debug!(base_url = %config.cart_api.base_url, "Cart session ready");

        Ok(Self {
            coordinator,
            events,
        })
    }

    /// Print the cart.
    pub fn show(mut self, json: bool) -> Result<(), CommandError> {
        let cart = self.coordinator.snapshot();
        if json {
            let report = CartReport {
                cart: &cart,
                events: self.drain_events(),
            };
            print_line(&serde_json::to_string_pretty(&report)?);
        } else {
            print_table(&cart);
        }
        Ok(())
    }

    /// Add `product` (or set its quantity) and print the result.
    pub async fn add(mut self, product: ProductSnapshot, quantity: i64) -> Result<(), CommandError> {
        let ticket = self.coordinator.begin_add(product, quantity)?;
        self.settle(ticket).await
    }

    /// Set a line's quantity and print the result.
    pub async fn set(mut self, product_id: &ProductId, quantity: i64) -> Result<(), CommandError> {
        let ticket = self.coordinator.begin_set_quantity(product_id, quantity)?;
        self.settle(ticket).await
    }

    /// Remove a line and print the result.
    pub async fn remove(mut self, product_id: &ProductId) -> Result<(), CommandError> {
        let ticket = self.coordinator.begin_remove(product_id)?;
        self.settle(ticket).await
    }

    /// Print the optimistic cart, wait for the service, then print the
    /// settled cart.
    async fn settle(&mut self, ticket: MutationTicket) -> Result<(), CommandError> {
        print_line("Pending:");
        print_table(&self.coordinator.snapshot());

        let result = self.coordinator.settle(ticket).await;
        let events = self.drain_events();
        let outcome = result?;
        tracing::info!(?outcome, ?events, "Cart updated");

        print_line("Saved:");
        print_table(&self.coordinator.snapshot());
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => kinds.push(event.kind()),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Cart event receiver lagged");
                }
                Err(_) => break,
            }
        }
        kinds
    }
}

/// Build a product snapshot from command-line arguments.
pub fn product(id: String, name: String, price: Price, stock: u32) -> ProductSnapshot {
    ProductSnapshot {
        id: ProductId::new(id),
        price,
        stock,
        name,
        image: None,
    }
}

/// Parse a `--price` argument.
pub fn parse_price(value: &str) -> Result<Price, String> {
    let amount = Decimal::from_str(value.trim()).map_err(|e| e.to_string())?;
    Price::new(amount).map_err(|e| e.to_string())
}

fn print_table(cart: &Cart) {
    if cart.is_empty() {
        print_line("Cart is empty");
        return;
    }
    for line in cart.lines() {
        let total = line
            .line_total()
            .map_or_else(|e| e.to_string(), |total| total.to_string());
        print_line(&format!(
            "{:>3} x {} ({}) @ {} = {total}",
            line.quantity,
            line.product.name,
            line.product_id(),
            line.unit_price(),
        ));
    }
    print_line(&format!("Subtotal: {}", cart.subtotal()));
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
