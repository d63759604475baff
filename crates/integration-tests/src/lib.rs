//! Integration tests for Cartwheel.
//!
//! [`FakeCartService`] is an in-process cart service bound to a random local
//! port. It speaks the same endpoints and payload shapes as the real one, so
//! the HTTP gateway and the coordinator can be exercised end to end.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p cartwheel-integration-tests
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]
// Test harness: panicking on a poisoned lock is the right failure mode
#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};

use cartwheel_storefront::{CartApiConfig, CredentialStore, HttpCartGateway};

/// The credential the fake service accepts.
pub const TOKEN: &str = "test-token";

/// How the next requests should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status and an error envelope.
    Status(StatusCode),
    /// Answer 200 with a body that is not a cart.
    Garbage,
}

#[derive(Debug, Default)]
struct ServiceState {
    catalog: HashMap<String, Value>,
    /// Cart lines in insertion order.
    items: Vec<(String, u32)>,
    fault: Option<Fault>,
    bare: bool,
    /// Delay applied after an update is stored, keyed by quantity.
    slow_quantities: HashMap<u32, Duration>,
    fetch_delay: Option<Duration>,
    requests: Vec<String>,
}

type Shared = Arc<Mutex<ServiceState>>;

/// A running fake cart service.
pub struct FakeCartService {
    addr: SocketAddr,
    state: Shared,
}

impl FakeCartService {
    /// Bind to `127.0.0.1:0` and start serving.
    pub async fn start() -> Self {
        let state = Shared::default();

        let app = Router::new()
            .route("/api/cart", get(fetch_cart))
            .route("/api/cart/item/{id}", post(update_item).delete(delete_item))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Base URL to configure the gateway with.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    /// Gateway pointed at this service holding `credentials`.
    #[must_use]
    pub fn gateway(&self, credentials: CredentialStore) -> HttpCartGateway {
        let config = CartApiConfig::new(&self.base_url()).unwrap();
        HttpCartGateway::new(&config, credentials).unwrap()
    }

    /// Gateway with a short transport timeout.
    #[must_use]
    pub fn gateway_with_timeout(&self, timeout: Duration) -> HttpCartGateway {
        let mut config = CartApiConfig::new(&self.base_url()).unwrap();
        config.request_timeout = timeout;
        HttpCartGateway::new(&config, authorized()).unwrap()
    }

    /// Make a product orderable.
    pub fn stock(&self, id: &str, name: &str, price: f64, stock: u32) {
        let product = json!({
            "_id": id,
            "name": name,
            "price": price,
            "stock": stock,
            "mainImage": { "url": format!("https://cdn.test/{id}.png"), "localPath": "" },
        });
        self.lock().catalog.insert(id.to_string(), product);
    }

    /// Put a line directly into the server-side cart.
    pub fn put_line(&self, id: &str, quantity: u32) {
        let mut state = self.lock();
        match state.items.iter_mut().find(|(item, _)| item == id) {
            Some(line) => line.1 = quantity,
            None => state.items.push((id.to_string(), quantity)),
        }
    }

    /// Server-side quantity of a line.
    #[must_use]
    pub fn quantity(&self, id: &str) -> Option<u32> {
        self.lock()
            .items
            .iter()
            .find(|(item, _)| item == id)
            .map(|(_, quantity)| *quantity)
    }

    /// Fail every request until [`Self::heal`] is called.
    pub fn inject(&self, fault: Fault) {
        self.lock().fault = Some(fault);
    }

    pub fn heal(&self) {
        self.lock().fault = None;
    }

    /// Answer with the bare cart document instead of the envelope.
    pub fn bare_responses(&self) {
        self.lock().bare = true;
    }

    /// Hold the response to an update to `quantity` (after storing it).
    pub fn slow_quantity(&self, quantity: u32, delay: Duration) {
        self.lock().slow_quantities.insert(quantity, delay);
    }

    pub fn slow_fetch(&self, delay: Duration) {
        self.lock().fetch_delay = Some(delay);
    }

    /// Requests received so far, as `"METHOD /path body"`.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }
}

/// Credential store holding [`TOKEN`].
#[must_use]
pub fn authorized() -> CredentialStore {
    CredentialStore::with_token(SecretString::from(TOKEN))
}

// =============================================================================
// Handlers
// =============================================================================

async fn fetch_cart(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let delay = {
        let mut state = state.lock().unwrap();
        state.requests.push("GET /cart".to_string());
        if let Some(rejection) = reject(&state, &headers) {
            return rejection;
        }
        state.fetch_delay
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let state = state.lock().unwrap();
    cart_response(&state, "Cart fetched successfully")
}

async fn update_item(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let (response, delay) = {
        let mut state = state.lock().unwrap();
        state.requests.push(format!("POST /cart/item/{id} {body}"));
        if let Some(rejection) = reject(&state, &headers) {
            return rejection;
        }

        let Some(quantity) = body
            .get("quantity")
            .and_then(Value::as_u64)
            .and_then(|q| u32::try_from(q).ok())
        else {
            return error_response(StatusCode::BAD_REQUEST, "quantity is required");
        };
        if !state.catalog.contains_key(&id) {
            return error_response(StatusCode::NOT_FOUND, "Product does not exist");
        }

        match state.items.iter_mut().find(|(item, _)| *item == id) {
            Some(line) => line.1 = quantity,
            None => state.items.push((id.clone(), quantity)),
        }
        let delay = state.slow_quantities.get(&quantity).copied();
        (cart_response(&state, "Item added successfully"), delay)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    response
}

async fn delete_item(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    state.requests.push(format!("DELETE /cart/item/{id}"));
    if let Some(rejection) = reject(&state, &headers) {
        return rejection;
    }

    let before = state.items.len();
    state.items.retain(|(item, _)| *item != id);
    if state.items.len() == before {
        return error_response(StatusCode::NOT_FOUND, "Item not in cart");
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Credential check, then any injected fault.
fn reject(state: &ServiceState, headers: &HeaderMap) -> Option<Response> {
    let expected = format!("Bearer {TOKEN}");
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected);
    if !authorized {
        return Some(error_response(StatusCode::UNAUTHORIZED, "jwt expired"));
    }

    match state.fault? {
        Fault::Status(status) => Some(error_response(status, "injected failure")),
        Fault::Garbage => Some((StatusCode::OK, "<html>maintenance</html>").into_response()),
    }
}

fn cart_response(state: &ServiceState, message: &str) -> Response {
    let mut total = 0.0;
    let items: Vec<Value> = state
        .items
        .iter()
        .filter_map(|(id, quantity)| {
            let product = state.catalog.get(id)?;
            total += product["price"].as_f64().unwrap_or_default() * f64::from(*quantity);
            Some(json!({ "_id": format!("line-{id}"), "product": product, "quantity": quantity }))
        })
        .collect();
    let cart = json!({
        "_id": "cart-1",
        "owner": "user-1",
        "items": items,
        "cartTotal": total,
        "discountedTotal": total,
    });

    if state.bare {
        return Json(cart).into_response();
    }
    Json(json!({
        "statusCode": 200,
        "data": cart,
        "message": message,
        "success": true,
    }))
    .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "statusCode": status.as_u16(),
        "data": null,
        "message": message,
        "success": false,
    });
    (status, Json(body)).into_response()
}
