//! Optimistic cart mutations with per-product request fencing.
//!
//! A mutation has two phases:
//!
//! 1. **Begin** (synchronous): assign the next request id for the product,
//!    capture the line's prior state, and write the new state into the
//!    [`LocalCartCache`]. The UI sees the change immediately.
//! 2. **Settle** (asynchronous): send the matching gateway call, then conclude
//!    synchronously. Only the product's *current* request may commit or roll
//!    back; a response for a superseded request is dropped on arrival.
//!
//! The fence table lock is held for each synchronous step and never across
//! an `.await`, so no two steps interleave mid-way.
//!
//! # Rollback targets
//!
//! A mutation that supersedes a still-pending one inherits the older
//! mutation's prior state: the last state the server is known to hold. If a
//! superseded request later succeeds, the current mutation's rollback target
//! advances to what that request wrote.
//!
//! # Reconciliation
//!
//! The epoch counter moves on every commit and every authoritative load. An
//! authoritative cart is only loaded if the epoch has not moved since its
//! request was issued; otherwise it predates a newer commit and is dropped.
//! After a load, every still-pending mutation is re-applied on top of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cartwheel_core::{Cart, CartLine, ProductId, ProductSnapshot};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::cache::{LocalCartCache, PriorState};
use super::events::CartEvent;
use super::gateway::CartGateway;
use crate::config::SyncConfig;
use crate::error::CartError;

/// What a mutation asks the cart service to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    /// Set the line to `quantity` (already clamped), inserting it if needed.
    Quantity {
        product: ProductSnapshot,
        quantity: u32,
    },
    /// Remove the line.
    Remove,
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

/// The in-flight change for a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    product_id: ProductId,
    request_id: u64,
    target: MutationTarget,
    prior: PriorState,
    /// Request whose confirmed write `prior` reflects; 0 for loaded state.
    prior_request_id: u64,
    status: MutationStatus,
}

impl PendingMutation {
    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    #[must_use]
    pub const fn target(&self) -> &MutationTarget {
        &self.target
    }

    /// The state a rollback would restore.
    #[must_use]
    pub const fn prior(&self) -> &PriorState {
        &self.prior
    }

    #[must_use]
    pub const fn status(&self) -> MutationStatus {
        self.status
    }
}

/// Handle for a begun mutation, consumed by [`MutationCoordinator::settle`].
#[derive(Debug)]
#[must_use = "an optimistic write stays unconfirmed until the ticket is settled"]
pub struct MutationTicket {
    product_id: ProductId,
    request_id: u64,
    target: MutationTarget,
    issued_epoch: u64,
}

impl MutationTicket {
    #[must_use]
    pub const fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    #[must_use]
    pub const fn target(&self) -> &MutationTarget {
        &self.target
    }
}

/// How a settled mutation ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// This request was current and the cart service accepted it.
    Committed,
    /// A newer request for the same product exists; this result was ignored.
    Superseded,
}

/// Result of [`MutationCoordinator::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The authoritative cart replaced the cache.
    Loaded,
    /// A commit landed while the fetch was in flight; the fetched cart was
    /// older than the cache and was dropped.
    Stale,
}

#[derive(Debug, Default)]
struct FenceTable {
    /// Last request id handed out per product. Never reset.
    last_request: HashMap<ProductId, u64>,
    /// The current pending mutation per product.
    pending: HashMap<ProductId, PendingMutation>,
    epoch: u64,
}

/// Coordinates optimistic writes to the cache with the remote cart service.
pub struct MutationCoordinator<G> {
    inner: Arc<Inner<G>>,
}

struct Inner<G> {
    gateway: G,
    cache: LocalCartCache,
    config: SyncConfig,
    fences: Mutex<FenceTable>,
    events: broadcast::Sender<CartEvent>,
}

impl<G> Clone for MutationCoordinator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G> std::fmt::Debug for MutationCoordinator<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("cache", &self.inner.cache)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<G: CartGateway> MutationCoordinator<G> {
    /// Create a coordinator writing to `cache`.
    #[must_use]
    pub fn new(gateway: G, cache: LocalCartCache, config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                gateway,
                cache,
                config,
                fences: Mutex::new(FenceTable::default()),
                events,
            }),
        }
    }

    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.inner.gateway
    }

    /// Read-only view of the current cart.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Cart> {
        self.inner.cache.snapshot()
    }

    /// Receive cart events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CartEvent> {
        self.inner.events.subscribe()
    }

    /// The in-flight mutation for a product, if any.
    #[must_use]
    pub fn pending(&self, product_id: &ProductId) -> Option<PendingMutation> {
        self.fences().pending.get(product_id).cloned()
    }

    /// Number of products with an in-flight mutation.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.fences().pending.len()
    }

    // =========================================================================
    // Begin (optimistic, synchronous)
    // =========================================================================

    /// Optimistically set the quantity of a line already in the cart.
    ///
    /// # Errors
    ///
    /// Returns `CartError::NotFound` if the product is not in the cart, or
    /// `CartError::OutOfRange` if the new subtotal is not representable. No
    /// request id is consumed and nothing is sent in either case.
    pub fn begin_set_quantity(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<MutationTicket, CartError> {
        let mut fences = self.fences();
        let prior = self.inner.cache.apply_quantity(product_id, quantity)?;
        let target = self.quantity_target(product_id)?;
        Ok(self.register(&mut fences, product_id, target, prior))
    }

    /// Optimistically add a product, or set its quantity if it is already in
    /// the cart.
    ///
    /// # Errors
    ///
    /// Returns `CartError::OutOfRange` if the line would push the subtotal
    /// past the representable range. Nothing is sent in that case.
    pub fn begin_add(
        &self,
        product: ProductSnapshot,
        quantity: i64,
    ) -> Result<MutationTicket, CartError> {
        let mut fences = self.fences();
        let product_id = product.id.clone();
        let prior = self.inner.cache.upsert(product.clone(), quantity)?;
        let target = self
            .quantity_target(&product_id)
            .unwrap_or(MutationTarget::Quantity {
                quantity: cartwheel_core::clamp_quantity(quantity, product.stock),
                product,
            });
        Ok(self.register(&mut fences, &product_id, target, prior))
    }

    /// Optimistically remove a line. Removing a product that is not in the
    /// cart still issues the delete; the service treats it as done.
    ///
    /// # Errors
    ///
    /// Propagates a cache failure; nothing is sent in that case.
    pub fn begin_remove(&self, product_id: &ProductId) -> Result<MutationTicket, CartError> {
        let mut fences = self.fences();
        let prior = self.inner.cache.remove(product_id)?;
        Ok(self.register(&mut fences, product_id, MutationTarget::Remove, prior))
    }

    fn quantity_target(&self, product_id: &ProductId) -> Result<MutationTarget, CartError> {
        self.inner
            .cache
            .snapshot()
            .line(product_id)
            .map(|line| MutationTarget::Quantity {
                product: line.product.clone(),
                quantity: line.quantity,
            })
            .ok_or_else(|| CartError::NotFound(product_id.clone()))
    }

    fn register(
        &self,
        fences: &mut FenceTable,
        product_id: &ProductId,
        target: MutationTarget,
        prior: PriorState,
    ) -> MutationTicket {
        let counter = fences.last_request.entry(product_id.clone()).or_insert(0);
        *counter += 1;
        let request_id = *counter;

        let (prior, prior_request_id) = match fences.pending.remove(product_id) {
            Some(older) => {
                debug!(
                    product_id = %product_id,
                    superseded = older.request_id,
                    request_id,
                    "Superseding pending mutation"
                );
                (older.prior, older.prior_request_id)
            }
            None => (prior, 0),
        };

        fences.pending.insert(
            product_id.clone(),
            PendingMutation {
                product_id: product_id.clone(),
                request_id,
                target: target.clone(),
                prior,
                prior_request_id,
                status: MutationStatus::Pending,
            },
        );

        debug!(product_id = %product_id, request_id, "Optimistic write applied");
        self.emit(CartEvent::Optimistic {
            product_id: product_id.clone(),
            request_id,
        });

        MutationTicket {
            product_id: product_id.clone(),
            request_id,
            target,
            issued_epoch: fences.epoch,
        }
    }

    // =========================================================================
    // Settle (remote call + synchronous conclusion)
    // =========================================================================

    /// Send the remote call for a begun mutation and conclude it.
    ///
    /// # Errors
    ///
    /// Returns the gateway error if this request was still current when it
    /// failed; the optimistic write has been rolled back by then. Failures of
    /// superseded requests are not errors.
    #[instrument(skip(self, ticket), fields(product_id = %ticket.product_id, request_id = ticket.request_id))]
    pub async fn settle(&self, ticket: MutationTicket) -> Result<MutationOutcome, CartError> {
        let gateway = &self.inner.gateway;
        let result = match &ticket.target {
            MutationTarget::Quantity { quantity, .. } => gateway
                .update_item(&ticket.product_id, *quantity)
                .await
                .map(Some),
            MutationTarget::Remove => gateway.delete_item(&ticket.product_id).await.map(|()| None),
        };

        let follow_up_epoch = {
            let mut fences = self.fences();
            let is_current = fences
                .pending
                .get(&ticket.product_id)
                .is_some_and(|pending| pending.request_id == ticket.request_id);

            if !is_current {
                self.discard(&mut fences, &ticket, result.is_ok());
                return Ok(MutationOutcome::Superseded);
            }

            let Some(mut pending) = fences.pending.remove(&ticket.product_id) else {
                return Ok(MutationOutcome::Superseded);
            };

            let authoritative = match result {
                Ok(authoritative) => authoritative,
                Err(err) => {
                    pending.status = MutationStatus::RolledBack;
                    self.roll_back(pending, &ticket, &err);
                    return Err(err);
                }
            };

            pending.status = MutationStatus::Committed;
            let unmoved = fences.epoch == ticket.issued_epoch;
            fences.epoch += 1;
            debug!(status = ?pending.status, "Mutation committed");
            self.emit(CartEvent::Committed {
                product_id: ticket.product_id.clone(),
                request_id: ticket.request_id,
            });

            if !self.inner.config.reload_after_commit {
                return Ok(MutationOutcome::Committed);
            }
            match authoritative {
                Some(cart) if unmoved => {
                    self.reconcile(&mut fences, cart);
                    return Ok(MutationOutcome::Committed);
                }
                Some(_) => {
                    warn!("Cart changed since request was issued, keeping optimistic state");
                    return Ok(MutationOutcome::Committed);
                }
                None => fences.epoch,
            }
        };

        // Deletes answer without a body, so the authoritative cart needs a
        // follow-up fetch. Its failure does not undo the commit.
        match self.inner.gateway.fetch().await {
            Ok(cart) => {
                let mut fences = self.fences();
                if fences.epoch == follow_up_epoch {
                    self.reconcile(&mut fences, cart);
                } else {
                    warn!("Follow-up fetch is stale, dropping");
                }
            }
            Err(err) => {
                warn!(error = %err, "Follow-up fetch after commit failed");
                if err == CartError::Unauthorized {
                    self.emit(CartEvent::SessionExpired);
                }
            }
        }

        Ok(MutationOutcome::Committed)
    }

    fn discard(&self, fences: &mut FenceTable, ticket: &MutationTicket, succeeded: bool) {
        debug!(succeeded, "Response for superseded request discarded");

        // The server now holds what this request wrote; that beats an older
        // rollback target.
        if succeeded
            && let Some(current) = fences.pending.get_mut(&ticket.product_id)
            && ticket.request_id > current.prior_request_id
        {
            current.prior = confirmed_state(&ticket.target, &current.prior, &self.inner.cache);
            current.prior_request_id = ticket.request_id;
        }

        self.emit(CartEvent::Discarded {
            product_id: ticket.product_id.clone(),
            request_id: ticket.request_id,
        });
    }

    fn roll_back(&self, pending: PendingMutation, ticket: &MutationTicket, err: &CartError) {
        warn!(
            error = %err,
            status = ?pending.status,
            prior_quantity = ?pending.prior.quantity(),
            "Remote update failed, rolling back optimistic write"
        );
        if let Err(restore_err) = self.inner.cache.restore(&pending.product_id, pending.prior) {
            error!(error = %restore_err, "Rollback could not be applied, cart needs a refresh");
        }

        self.emit(CartEvent::RolledBack {
            product_id: ticket.product_id.clone(),
            request_id: ticket.request_id,
            error: err.clone(),
        });
        if *err == CartError::Unauthorized {
            error!("Cart session expired");
            self.emit(CartEvent::SessionExpired);
        }
    }

    // =========================================================================
    // Convenience (begin + settle)
    // =========================================================================

    /// Set the quantity of a line in the cart.
    ///
    /// # Errors
    ///
    /// Returns `CartError::NotFound` if the product is not in the cart, or the
    /// gateway error after rolling back.
    pub async fn set_quantity(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<MutationOutcome, CartError> {
        let ticket = self.begin_set_quantity(product_id, quantity)?;
        self.settle(ticket).await
    }

    /// Add a product to the cart (or set its quantity if already present).
    ///
    /// # Errors
    ///
    /// Returns `CartError::OutOfRange` if the subtotal would overflow, or the
    /// gateway error after rolling back.
    pub async fn add_item(
        &self,
        product: ProductSnapshot,
        quantity: i64,
    ) -> Result<MutationOutcome, CartError> {
        let ticket = self.begin_add(product, quantity)?;
        self.settle(ticket).await
    }

    /// Remove a line from the cart.
    ///
    /// # Errors
    ///
    /// Returns the gateway error after rolling back.
    pub async fn remove_item(&self, product_id: &ProductId) -> Result<MutationOutcome, CartError> {
        let ticket = self.begin_remove(product_id)?;
        self.settle(ticket).await
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Fetch the authoritative cart and load it into the cache.
    ///
    /// # Errors
    ///
    /// Returns the gateway error; the cache is left untouched.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, CartError> {
        let issued_epoch = self.fences().epoch;

        let cart = match self.inner.gateway.fetch().await {
            Ok(cart) => cart,
            Err(err) => {
                if err == CartError::Unauthorized {
                    error!("Cart session expired");
                    self.emit(CartEvent::SessionExpired);
                }
                return Err(err);
            }
        };

        let mut fences = self.fences();
        if fences.epoch != issued_epoch {
            warn!("Cart changed while fetching, dropping stale cart");
            return Ok(RefreshOutcome::Stale);
        }
        self.reconcile(&mut fences, cart);
        drop(fences);

        let cart = self.snapshot();
        info!(lines = cart.lines().len(), subtotal = %cart.subtotal(), "Cart loaded");
        Ok(RefreshOutcome::Loaded)
    }

    /// Discard the cart and all pending bookkeeping (logout).
    ///
    /// Request counters survive, so responses to requests sent before the
    /// logout are still recognized as stale.
    pub fn clear(&self) {
        let mut fences = self.fences();
        fences.pending.clear();
        fences.epoch += 1;
        self.inner.cache.clear();
        debug!("Cart cleared");
    }

    /// Load `cart` and re-apply every pending mutation on top of it.
    fn reconcile(&self, fences: &mut FenceTable, cart: Cart) {
        let cache = &self.inner.cache;
        cache.load(cart);
        fences.epoch += 1;

        for pending in fences.pending.values_mut() {
            let rebased = match &pending.target {
                MutationTarget::Quantity { product, quantity } => {
                    let quantity = i64::from(*quantity);
                    match cache.apply_quantity(&pending.product_id, quantity) {
                        Err(CartError::NotFound(_)) => cache.upsert(product.clone(), quantity),
                        applied => applied,
                    }
                }
                MutationTarget::Remove => cache.remove(&pending.product_id),
            };
            // A pending write that no longer fits stays in flight but is not
            // shown; its rollback target is the loaded line.
            pending.prior = rebased.unwrap_or_else(|err| {
                warn!(
                    product_id = %pending.product_id,
                    error = %err,
                    "Pending mutation could not be re-applied to the loaded cart"
                );
                loaded_state(cache, &pending.product_id)
            });
        }

        self.emit(CartEvent::Reloaded);
    }

    fn fences(&self) -> MutexGuard<'_, FenceTable> {
        // No critical section can leave the table half-updated
        self.inner
            .fences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: CartEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }
}

/// The line for `product_id` as the cache currently holds it.
fn loaded_state(cache: &LocalCartCache, product_id: &ProductId) -> PriorState {
    cache
        .snapshot()
        .lines()
        .iter()
        .enumerate()
        .find(|(_, line)| line.product_id() == product_id)
        .map_or(PriorState::Absent, |(position, line)| PriorState::Present {
            line: line.clone(),
            position,
        })
}

/// The line state after `target` was confirmed by the server, placed where
/// the line currently sits.
fn confirmed_state(
    target: &MutationTarget,
    current_prior: &PriorState,
    cache: &LocalCartCache,
) -> PriorState {
    match target {
        MutationTarget::Remove => PriorState::Absent,
        MutationTarget::Quantity { product, quantity } => {
            let snapshot = cache.snapshot();
            let position = snapshot
                .lines()
                .iter()
                .position(|line| line.product_id() == &product.id)
                .or(match current_prior {
                    PriorState::Present { position, .. } => Some(*position),
                    PriorState::Absent => None,
                })
                .unwrap_or(snapshot.lines().len());
            PriorState::Present {
                line: CartLine::new(product.clone(), *quantity),
                position,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use cartwheel_core::{Price, subtotal};

    use super::*;

    // =========================================================================
    // Scripted gateway
    // =========================================================================

    /// In-memory cart service. Holds its own authoritative lines, and can be
    /// told to fail or delay specific calls.
    #[derive(Default)]
    struct ScriptedGateway {
        server: Mutex<Vec<CartLine>>,
        catalog: Mutex<HashMap<ProductId, ProductSnapshot>>,
        fail_next: Mutex<Option<CartError>>,
        fail_quantity: Mutex<HashMap<u32, CartError>>,
        delay_quantity: Mutex<HashMap<u32, Duration>>,
        fetch_delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn with_lines(lines: Vec<CartLine>) -> Self {
            let gateway = Self::default();
            for line in &lines {
                gateway.stock(line.product.clone());
            }
            *gateway.server.lock().unwrap() = lines;
            gateway
        }

        fn stock(&self, product: ProductSnapshot) {
            self.catalog
                .lock()
                .unwrap()
                .insert(product.id.clone(), product);
        }

        fn fail_next(&self, err: CartError) {
            *self.fail_next.lock().unwrap() = Some(err);
        }

        fn fail_quantity(&self, quantity: u32, err: CartError) {
            self.fail_quantity.lock().unwrap().insert(quantity, err);
        }

        fn delay_quantity(&self, quantity: u32, delay: Duration) {
            self.delay_quantity.lock().unwrap().insert(quantity, delay);
        }

        fn server_cart(&self) -> Cart {
            Cart::new(self.server.lock().unwrap().clone()).unwrap()
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn take_failure(&self) -> Option<CartError> {
            self.fail_next.lock().unwrap().take()
        }
    }

    impl CartGateway for ScriptedGateway {
        async fn fetch(&self) -> Result<Cart, CartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.fetch_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            Ok(self.server_cart())
        }

        async fn update_item(&self, product_id: &ProductId, quantity: u32) -> Result<Cart, CartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_quantity.lock().unwrap().get(&quantity).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            if let Some(err) = self.fail_quantity.lock().unwrap().get(&quantity).cloned() {
                return Err(err);
            }

            let product = self
                .catalog
                .lock()
                .unwrap()
                .get(product_id)
                .cloned()
                .ok_or_else(|| CartError::NotFound(product_id.clone()))?;
            let mut server = self.server.lock().unwrap();
            match server.iter_mut().find(|line| line.product_id() == product_id) {
                Some(line) => {
                    line.product = product;
                    line.quantity = quantity;
                }
                None => server.push(CartLine::new(product, quantity)),
            }
            Ok(Cart::new(server.clone())?)
        }

        async fn delete_item(&self, product_id: &ProductId) -> Result<(), CartError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            self.server
                .lock()
                .unwrap()
                .retain(|line| line.product_id() != product_id);
            Ok(())
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn product(id: &str, cents: i64, stock: u32) -> ProductSnapshot {
        ProductSnapshot {
            id: ProductId::from(id),
            price: Price::from_cents(cents).unwrap(),
            stock,
            name: format!("Product {id}"),
            image: None,
        }
    }

    fn line(id: &str, cents: i64, stock: u32, quantity: u32) -> CartLine {
        CartLine::new(product(id, cents, stock), quantity)
    }

    fn pid(id: &str) -> ProductId {
        ProductId::from(id)
    }

    /// Coordinator whose cache and server both start with `lines`.
    fn coordinator(
        lines: Vec<CartLine>,
        reload_after_commit: bool,
    ) -> MutationCoordinator<ScriptedGateway> {
        let cache = LocalCartCache::new();
        cache.load(Cart::new(lines.clone()).unwrap());
        MutationCoordinator::new(
            ScriptedGateway::with_lines(lines),
            cache,
            SyncConfig {
                reload_after_commit,
                event_capacity: 64,
            },
        )
    }

    fn quantity_of(coordinator: &MutationCoordinator<ScriptedGateway>, id: &str) -> Option<u32> {
        coordinator.snapshot().line(&pid(id)).map(|line| line.quantity)
    }

    fn assert_subtotal_consistent(coordinator: &MutationCoordinator<ScriptedGateway>) {
        let cart = coordinator.snapshot();
        assert_eq!(cart.subtotal(), subtotal(cart.lines()).unwrap());
    }

    fn drain(receiver: &mut broadcast::Receiver<CartEvent>) -> Vec<CartEvent> {
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    // =========================================================================
    // Optimistic write and rollback
    // =========================================================================

    #[tokio::test]
    async fn test_optimistic_write_visible_before_network() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 3)], false);

        let ticket = coordinator.begin_set_quantity(&pid("p"), 7).unwrap();

        assert_eq!(quantity_of(&coordinator, "p"), Some(7));
        assert_eq!(coordinator.snapshot().subtotal(), Price::from_cents(7000).unwrap());
        assert_eq!(coordinator.gateway().calls(), 0);
        assert_eq!(
            coordinator.pending(&pid("p")).map(|p| p.status()),
            Some(MutationStatus::Pending)
        );

        let outcome = coordinator.settle(ticket).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Committed);
        assert_eq!(quantity_of(&coordinator, "p"), Some(7));
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_exact_prior_quantity() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 3)], false);
        let mut events = coordinator.subscribe();
        coordinator
            .gateway()
            .fail_next(CartError::Unavailable("connection reset".to_string()));

        let err = coordinator.set_quantity(&pid("p"), 7).await.unwrap_err();

        assert_eq!(err, CartError::Unavailable("connection reset".to_string()));
        assert_eq!(quantity_of(&coordinator, "p"), Some(3));
        assert_eq!(coordinator.snapshot().subtotal(), Price::from_cents(3000).unwrap());
        assert_eq!(coordinator.pending_count(), 0);

        let events = drain(&mut events);
        assert!(events.contains(&CartEvent::RolledBack {
            product_id: pid("p"),
            request_id: 1,
            error: err,
        }));
    }

    #[tokio::test]
    async fn test_add_to_empty_cart_then_unavailable_reverts_to_absent() {
        let coordinator = coordinator(vec![], false);
        coordinator.gateway().stock(product("P", 1000, 5));
        coordinator
            .gateway()
            .fail_next(CartError::Unavailable("HTTP 503".to_string()));

        let ticket = coordinator.begin_add(product("P", 1000, 5), 2).unwrap();
        assert_eq!(quantity_of(&coordinator, "P"), Some(2));
        assert_eq!(coordinator.snapshot().subtotal(), Price::from_cents(2000).unwrap());

        let err = coordinator.settle(ticket).await.unwrap_err();
        assert!(matches!(err, CartError::Unavailable(_)));
        assert!(coordinator.snapshot().is_empty());
        assert_eq!(coordinator.snapshot().subtotal(), Price::ZERO);
    }

    #[tokio::test]
    async fn test_add_past_representable_subtotal_is_refused_locally() {
        let coordinator = coordinator(vec![line("a", 1000, 5, 1)], false);
        let huge = ProductSnapshot {
            price: Price::MAX,
            ..product("H", 0, 9)
        };
        let before = coordinator.snapshot();

        let err = coordinator.add_item(huge, 2).await.unwrap_err();

        assert_eq!(err, CartError::OutOfRange(cartwheel_core::PriceError::Overflow));
        assert!(!err.is_retryable());
        assert_eq!(*coordinator.snapshot(), *before);
        assert_eq!(coordinator.pending_count(), 0);
        assert_eq!(coordinator.gateway().calls(), 0);
    }

    #[tokio::test]
    async fn test_add_clamps_to_stock() {
        let coordinator = coordinator(vec![], false);
        coordinator.gateway().stock(product("P", 1000, 5));

        let ticket = coordinator.begin_add(product("P", 1000, 5), 8).unwrap();
        assert_eq!(
            ticket.target(),
            &MutationTarget::Quantity {
                product: product("P", 1000, 5),
                quantity: 5,
            }
        );
        coordinator.settle(ticket).await.unwrap();
        assert_eq!(coordinator.gateway().server_cart().item_count(), 5);
    }

    #[tokio::test]
    async fn test_set_quantity_on_missing_product_sends_nothing() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 3)], false);

        let err = coordinator.set_quantity(&pid("q"), 2).await.unwrap_err();

        assert_eq!(err, CartError::NotFound(pid("q")));
        assert_eq!(coordinator.gateway().calls(), 0);
        assert!(coordinator.pending(&pid("q")).is_none());
    }

    #[tokio::test]
    async fn test_server_not_found_rolls_back_quantity_update() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 3)], false);
        coordinator
            .gateway()
            .fail_next(CartError::NotFound(pid("p")));

        let err = coordinator.set_quantity(&pid("p"), 5).await.unwrap_err();

        assert_eq!(err, CartError::NotFound(pid("p")));
        assert_eq!(quantity_of(&coordinator, "p"), Some(3));
    }

    #[tokio::test]
    async fn test_unauthorized_rolls_back_and_reports_session_expired() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 3)], false);
        let mut events = coordinator.subscribe();
        coordinator.gateway().fail_next(CartError::Unauthorized);

        let err = coordinator.set_quantity(&pid("p"), 5).await.unwrap_err();

        assert_eq!(err, CartError::Unauthorized);
        assert_eq!(quantity_of(&coordinator, "p"), Some(3));
        assert!(drain(&mut events).contains(&CartEvent::SessionExpired));
    }

    // =========================================================================
    // Removal
    // =========================================================================

    #[tokio::test]
    async fn test_remove_commits_and_is_idempotent() {
        let coordinator = coordinator(vec![line("a", 100, 5, 1), line("b", 200, 5, 2)], true);

        assert_eq!(
            coordinator.remove_item(&pid("a")).await.unwrap(),
            MutationOutcome::Committed
        );
        let after_first = coordinator.snapshot();
        assert_eq!(
            coordinator.remove_item(&pid("a")).await.unwrap(),
            MutationOutcome::Committed
        );

        assert_eq!(*coordinator.snapshot(), *after_first);
        assert!(!coordinator.snapshot().contains(&pid("a")));
        assert_subtotal_consistent(&coordinator);
    }

    #[tokio::test]
    async fn test_remove_failure_reinserts_at_original_position() {
        let lines = vec![line("a", 100, 5, 1), line("b", 200, 5, 2), line("c", 300, 5, 3)];
        let coordinator = coordinator(lines.clone(), false);
        coordinator
            .gateway()
            .fail_next(CartError::Unavailable("timeout".to_string()));

        let ticket = coordinator.begin_remove(&pid("b")).unwrap();
        assert!(!coordinator.snapshot().contains(&pid("b")));
        assert!(coordinator.settle(ticket).await.is_err());

        assert_eq!(coordinator.snapshot().lines(), lines.as_slice());
        assert_subtotal_consistent(&coordinator);
    }

    // =========================================================================
    // Fencing
    // =========================================================================

    #[tokio::test]
    async fn test_newer_response_first_then_stale_response_is_ignored() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 1)], false);
        let mut events = coordinator.subscribe();

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();
        assert_eq!(quantity_of(&coordinator, "p"), Some(9));

        assert_eq!(coordinator.settle(nine).await.unwrap(), MutationOutcome::Committed);
        assert_eq!(coordinator.settle(four).await.unwrap(), MutationOutcome::Superseded);

        assert_eq!(quantity_of(&coordinator, "p"), Some(9));
        assert_subtotal_consistent(&coordinator);
        assert!(drain(&mut events).contains(&CartEvent::Discarded {
            product_id: pid("p"),
            request_id: 1,
        }));
    }

    #[tokio::test]
    async fn test_stale_response_first_then_newer_commits() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 1)], true);

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();

        assert_eq!(coordinator.settle(four).await.unwrap(), MutationOutcome::Superseded);
        // The late "4" changed nothing
        assert_eq!(quantity_of(&coordinator, "p"), Some(9));

        assert_eq!(coordinator.settle(nine).await.unwrap(), MutationOutcome::Committed);
        assert_eq!(quantity_of(&coordinator, "p"), Some(9));
    }

    #[tokio::test]
    async fn test_concurrent_settles_converge_on_last_request() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 1)], true);
        // The older request is the slow one, so its response lands last
        coordinator
            .gateway()
            .delay_quantity(4, Duration::from_millis(50));

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();

        let (four, nine) = tokio::join!(coordinator.settle(four), coordinator.settle(nine));

        assert_eq!(four.unwrap(), MutationOutcome::Superseded);
        assert_eq!(nine.unwrap(), MutationOutcome::Committed);
        assert_eq!(quantity_of(&coordinator, "p"), Some(9));
        assert_subtotal_consistent(&coordinator);
    }

    #[tokio::test]
    async fn test_superseded_failure_is_swallowed() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 1)], false);
        coordinator
            .gateway()
            .fail_quantity(4, CartError::Unavailable("HTTP 500".to_string()));

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();

        assert_eq!(coordinator.settle(four).await.unwrap(), MutationOutcome::Superseded);
        assert_eq!(quantity_of(&coordinator, "p"), Some(9));
        assert_eq!(coordinator.settle(nine).await.unwrap(), MutationOutcome::Committed);
    }

    #[tokio::test]
    async fn test_superseding_mutation_inherits_last_known_server_state() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 3)], false);
        coordinator
            .gateway()
            .fail_quantity(4, CartError::Unavailable("HTTP 500".to_string()));
        coordinator
            .gateway()
            .fail_quantity(9, CartError::Unavailable("HTTP 500".to_string()));

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();
        assert_eq!(
            coordinator.pending(&pid("p")).unwrap().prior().quantity(),
            Some(3)
        );

        assert_eq!(coordinator.settle(four).await.unwrap(), MutationOutcome::Superseded);
        assert!(coordinator.settle(nine).await.is_err());

        // Back to what the server held before either request, not to 4
        assert_eq!(quantity_of(&coordinator, "p"), Some(3));
    }

    #[tokio::test]
    async fn test_superseded_success_advances_rollback_target() {
        let coordinator = coordinator(vec![line("p", 1000, 20, 3)], false);
        coordinator
            .gateway()
            .fail_quantity(9, CartError::Unavailable("HTTP 500".to_string()));

        let four = coordinator.begin_set_quantity(&pid("p"), 4).unwrap();
        let nine = coordinator.begin_set_quantity(&pid("p"), 9).unwrap();

        assert_eq!(coordinator.settle(four).await.unwrap(), MutationOutcome::Superseded);
        assert_eq!(
            coordinator.pending(&pid("p")).unwrap().prior().quantity(),
            Some(4)
        );
        assert!(coordinator.settle(nine).await.is_err());

        // The server accepted 4, so that is where the rollback lands
        assert_eq!(quantity_of(&coordinator, "p"), Some(4));
        assert_eq!(coordinator.gateway().server_cart().item_count(), 4);
    }

    #[tokio::test]
    async fn test_products_are_fenced_independently() {
        let coordinator = coordinator(vec![line("a", 100, 9, 1), line("b", 200, 9, 1)], false);

        let a = coordinator.begin_set_quantity(&pid("a"), 2).unwrap();
        let b = coordinator.begin_set_quantity(&pid("b"), 3).unwrap();
        assert_eq!(a.request_id(), 1);
        assert_eq!(b.request_id(), 1);

        assert_eq!(coordinator.settle(b).await.unwrap(), MutationOutcome::Committed);
        assert_eq!(coordinator.settle(a).await.unwrap(), MutationOutcome::Committed);
        assert_eq!(quantity_of(&coordinator, "a"), Some(2));
        assert_eq!(quantity_of(&coordinator, "b"), Some(3));
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[tokio::test]
    async fn test_reload_after_commit_absorbs_server_price_change() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 1)], true);
        // Price went up server-side since the cart was fetched
        coordinator.gateway().stock(product("p", 1200, 10));

        coordinator.set_quantity(&pid("p"), 2).await.unwrap();

        let cart = coordinator.snapshot();
        assert_eq!(cart.lines()[0].unit_price(), Price::from_cents(1200).unwrap());
        assert_eq!(cart.subtotal(), Price::from_cents(2400).unwrap());
    }

    #[tokio::test]
    async fn test_without_reload_commit_keeps_optimistic_state() {
        let coordinator = coordinator(vec![line("p", 1000, 10, 1)], false);
        coordinator.gateway().stock(product("p", 1200, 10));

        coordinator.set_quantity(&pid("p"), 2).await.unwrap();

        assert_eq!(coordinator.snapshot().subtotal(), Price::from_cents(2000).unwrap());
    }

    #[tokio::test]
    async fn test_reload_rebases_other_pending_mutations() {
        let coordinator = coordinator(vec![line("a", 100, 9, 1), line("b", 200, 9, 1)], true);

        let a = coordinator.begin_set_quantity(&pid("a"), 5).unwrap();
        // b commits first; the server's cart still has a at 1
        coordinator.set_quantity(&pid("b"), 3).await.unwrap();

        assert_eq!(quantity_of(&coordinator, "a"), Some(5));
        assert_eq!(quantity_of(&coordinator, "b"), Some(3));
        assert_eq!(
            coordinator.pending(&pid("a")).unwrap().prior().quantity(),
            Some(1)
        );
        assert_subtotal_consistent(&coordinator);

        assert_eq!(coordinator.settle(a).await.unwrap(), MutationOutcome::Committed);
        assert_eq!(quantity_of(&coordinator, "a"), Some(5));
    }

    #[tokio::test]
    async fn test_delete_commit_reloads_with_follow_up_fetch() {
        let coordinator = coordinator(vec![line("a", 100, 9, 1), line("b", 200, 9, 1)], true);
        // Someone else added a line server-side
        coordinator.gateway().stock(product("c", 300, 9));
        coordinator
            .gateway()
            .server
            .lock()
            .unwrap()
            .push(line("c", 300, 9, 2));

        coordinator.remove_item(&pid("a")).await.unwrap();

        let ids: Vec<_> = coordinator
            .snapshot()
            .lines()
            .iter()
            .map(|l| l.product_id().to_string())
            .collect();
        assert_eq!(ids, ["b", "c"]);
        assert_subtotal_consistent(&coordinator);
    }

    #[tokio::test]
    async fn test_refresh_loads_authoritative_cart() {
        let coordinator = coordinator(vec![], true);
        coordinator
            .gateway()
            .server
            .lock()
            .unwrap()
            .push(line("a", 250, 9, 2));

        assert_eq!(coordinator.refresh().await.unwrap(), RefreshOutcome::Loaded);
        assert_eq!(coordinator.snapshot().subtotal(), Price::from_cents(500).unwrap());
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_cache_untouched() {
        let coordinator = coordinator(vec![line("a", 250, 9, 2)], true);
        coordinator
            .gateway()
            .fail_next(CartError::Unavailable("HTTP 502".to_string()));

        assert!(coordinator.refresh().await.is_err());
        assert_eq!(quantity_of(&coordinator, "a"), Some(2));
    }

    #[tokio::test]
    async fn test_refresh_overtaken_by_commit_is_stale() {
        let coordinator = coordinator(vec![line("a", 250, 9, 2)], true);
        *coordinator.gateway().fetch_delay.lock().unwrap() = Some(Duration::from_millis(50));

        let refresh = coordinator.refresh();
        let commit = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coordinator.set_quantity(&pid("a"), 4).await
        };
        let (refresh, commit) = tokio::join!(refresh, commit);

        assert_eq!(commit.unwrap(), MutationOutcome::Committed);
        assert_eq!(refresh.unwrap(), RefreshOutcome::Stale);
        assert_eq!(quantity_of(&coordinator, "a"), Some(4));
    }

    #[tokio::test]
    async fn test_clear_turns_late_responses_into_no_ops() {
        let coordinator = coordinator(vec![line("a", 250, 9, 2)], true);

        let ticket = coordinator.begin_set_quantity(&pid("a"), 5).unwrap();
        coordinator.clear();

        assert_eq!(coordinator.settle(ticket).await.unwrap(), MutationOutcome::Superseded);
        assert!(coordinator.snapshot().is_empty());
        assert_eq!(coordinator.pending_count(), 0);
    }
}
