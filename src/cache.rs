//! Order Cache & Optimistic Mutator.
//!
//! Holds the last-known order collection per query and publishes every
//! change on a `watch` channel so views can recompute. Mutations run in
//! three phases:
//!
//! 1. [`OrderCache::apply`]: patch the cached order in place (a full
//!    replacement of that one order) and keep the pre-mutation snapshots
//! 2. [`OrderCache::commit`]: issue the request; on failure restore the
//!    snapshots exactly
//! 3. [`OrderCache::reconcile`]: after the staleness window, mark every
//!    entry stale and refetch, whatever the commit outcome was
//!
//! A second mutation for an order whose first is still in flight is skipped.
//! How a refetch is combined with the cached rows is a [`MergePolicy`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::models::{EventKind, NotificationEnvelope, Order, OrderId, OrderPatch, OrderStatus, PaymentType};
use crate::store::{ListQuery, OrderStore};

/// Cache entries are keyed by the query that produced them.
pub type QueryKey = ListQuery;

/// Immutable view of one entry's orders. Cheap to clone.
pub type OrderSnapshot = Arc<Vec<Order>>;

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// Combines the cached rows with a fresh fetch.
pub trait MergePolicy: Send + Sync + 'static {
    fn merge(&self, cached: &[Order], fetched: Vec<Order>) -> Vec<Order>;
}

/// The server is authoritative: the fetch replaces the cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceAll;

impl MergePolicy for ReplaceAll {
    fn merge(&self, _cached: &[Order], fetched: Vec<Order>) -> Vec<Order> {
        fetched
    }
}

/// Per order, keep whichever copy carries the later `updatedAt`. Guards
/// against a slow list response overwriting a newer pushed update.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepNewer;

impl MergePolicy for KeepNewer {
    fn merge(&self, cached: &[Order], fetched: Vec<Order>) -> Vec<Order> {
        let by_id: HashMap<&OrderId, &Order> = cached.iter().map(|o| (&o.id, o)).collect();
        fetched
            .into_iter()
            .map(|fresh| match by_id.get(&fresh.id) {
                Some(held) if held.updated_at > fresh.updated_at => (*held).clone(),
                _ => fresh,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Mutation bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Request committed.
    Applied,
    /// Another mutation for the order was in flight; nothing was sent.
    Skipped,
}

/// Releases the order's in-flight mark when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<OrderId>>>,
    id: OrderId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

/// Output of [`OrderCache::apply`], consumed by [`OrderCache::commit`].
pub struct PendingMutation {
    id: OrderId,
    patch: OrderPatch,
    snapshots: Vec<(QueryKey, OrderSnapshot)>,
    _guard: InFlightGuard,
}

impl PendingMutation {
    pub fn order_id(&self) -> &OrderId {
        &self.id
    }

    pub fn patch(&self) -> &OrderPatch {
        &self.patch
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Page metadata of the last fetch for a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub total_pages: u32,
    pub current_page: u32,
    pub total: u64,
}

struct Entry {
    orders: watch::Sender<OrderSnapshot>,
    stale: bool,
    page: PageInfo,
}

impl Entry {
    fn new() -> Self {
        let (orders, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            orders,
            stale: true,
            page: PageInfo::default(),
        }
    }

    fn current(&self) -> OrderSnapshot {
        Arc::clone(&self.orders.borrow())
    }

    fn publish(&self, next: OrderSnapshot) {
        self.orders.send_replace(next);
    }
}

struct Inner<S> {
    store: Arc<S>,
    merge: Box<dyn MergePolicy>,
    staleness_window: Duration,
    entries: Mutex<HashMap<QueryKey, Entry>>,
    in_flight: Arc<Mutex<HashSet<OrderId>>>,
    reconcile_scheduled: AtomicBool,
}

/// Query-keyed order cache. Cloning yields another handle to the same cache.
pub struct OrderCache<S: OrderStore> {
    inner: Arc<Inner<S>>,
}

impl<S: OrderStore> Clone for OrderCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: OrderStore> OrderCache<S> {
    pub fn new(store: Arc<S>, config: &CacheConfig) -> Self {
        Self::with_merge_policy(store, config, ReplaceAll)
    }

    pub fn with_merge_policy(store: Arc<S>, config: &CacheConfig, merge: impl MergePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                merge: Box::new(merge),
                staleness_window: config.staleness_window(),
                entries: Mutex::new(HashMap::new()),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                reconcile_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn staleness_window(&self) -> Duration {
        self.inner.staleness_window
    }

    // -- reads --------------------------------------------------------------

    /// Fetch `key` from the store, merge, publish and clear the stale mark.
    pub async fn fetch(&self, key: &QueryKey) -> Result<OrderSnapshot> {
        let page = self.inner.store.list_orders(key).await?;
        let mut entries = lock(&self.inner.entries);
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        let merged = self.inner.merge.merge(&entry.current(), page.orders);
        let snapshot = Arc::new(merged);
        entry.page = PageInfo {
            total_pages: page.total_pages,
            current_page: page.current_page,
            total: page.total,
        };
        entry.stale = false;
        entry.publish(Arc::clone(&snapshot));
        debug!(orders = snapshot.len(), "Order cache refreshed");
        Ok(snapshot)
    }

    /// Cached rows, fetching first when missing or stale.
    pub async fn get_or_fetch(&self, key: &QueryKey) -> Result<OrderSnapshot> {
        let cached = {
            let entries = lock(&self.inner.entries);
            entries
                .get(key)
                .filter(|e| !e.stale)
                .map(Entry::current)
        };
        match cached {
            Some(snapshot) => Ok(snapshot),
            None => self.fetch(key).await,
        }
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<OrderSnapshot> {
        lock(&self.inner.entries).get(key).map(Entry::current)
    }

    pub fn page_info(&self, key: &QueryKey) -> Option<PageInfo> {
        lock(&self.inner.entries).get(key).map(|e| e.page)
    }

    /// Change feed for `key`; creates an empty stale entry when missing.
    pub fn subscribe(&self, key: &QueryKey) -> watch::Receiver<OrderSnapshot> {
        lock(&self.inner.entries)
            .entry(key.clone())
            .or_insert_with(Entry::new)
            .orders
            .subscribe()
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        lock(&self.inner.entries)
            .get(key)
            .map(|e| e.stale)
            .unwrap_or(true)
    }

    pub fn invalidate(&self, key: &QueryKey) {
        if let Some(entry) = lock(&self.inner.entries).get_mut(key) {
            entry.stale = true;
        }
    }

    pub fn invalidate_all(&self) {
        for entry in lock(&self.inner.entries).values_mut() {
            entry.stale = true;
        }
    }

    pub fn is_in_flight(&self, id: &OrderId) -> bool {
        lock(&self.inner.in_flight).contains(id)
    }

    // -- three-phase mutation -----------------------------------------------

    /// Phase 1: optimistic local patch.
    ///
    /// Fails with [`Error::MutationInFlight`] when the order already has a
    /// pending mutation and with [`Error::InvalidTransition`] when the patch
    /// would leave a terminal status. Neither failure touches the cache.
    pub fn apply(&self, id: &OrderId, patch: OrderPatch) -> Result<PendingMutation> {
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.contains(id) {
                return Err(Error::MutationInFlight(id.clone()));
            }
            in_flight.insert(id.clone());
        }
        let guard = InFlightGuard {
            set: Arc::clone(&self.inner.in_flight),
            id: id.clone(),
        };

        let entries = lock(&self.inner.entries);

        if let Some(next) = patch.status {
            let current = entries
                .values()
                .find_map(|e| e.current().iter().find(|o| &o.id == id).map(|o| o.status));
            if let Some(from) = current {
                if !from.can_transition_to(next) {
                    return Err(Error::InvalidTransition { from, to: next });
                }
            }
        }

        let mut snapshots = Vec::new();
        for (key, entry) in entries.iter() {
            let before = entry.current();
            let Some(pos) = before.iter().position(|o| &o.id == id) else {
                continue;
            };
            let mut after = Vec::clone(&before);
            after[pos] = patch.applied_to(&before[pos]);
            entry.publish(Arc::new(after));
            snapshots.push((key.clone(), before));
        }
        debug!(order_id = %id, entries = snapshots.len(), "Optimistic patch applied");

        Ok(PendingMutation {
            id: id.clone(),
            patch,
            snapshots,
            _guard: guard,
        })
    }

    /// Phase 2: send the request. On failure the pre-mutation snapshots are
    /// restored exactly and the error is returned.
    pub async fn commit(&self, pending: PendingMutation) -> Result<()> {
        let store = &self.inner.store;
        let id = &pending.id;
        let patch = &pending.patch;
        let status_only = patch.status.filter(|s| OrderPatch::status(*s) == *patch);
        let payment_only = patch.type_of_payment.filter(|kind| {
            OrderPatch {
                type_of_payment: Some(*kind),
                ..Default::default()
            } == *patch
        });

        let result = if let Some(status) = status_only {
            store.update_status(id, status).await
        } else if let Some(kind) = payment_only {
            store.update_payment_method(id, kind).await
        } else {
            store.update_order(id, patch).await
        };

        match result {
            Ok(echoed) => {
                if let Some(order) = echoed.filter(|o| &o.id == id) {
                    self.replace_order(&order);
                }
                info!(order_id = %id, "Order mutation committed");
                Ok(())
            }
            Err(e) => {
                let entries = lock(&self.inner.entries);
                for (key, snapshot) in &pending.snapshots {
                    if let Some(entry) = entries.get(key) {
                        entry.publish(Arc::clone(snapshot));
                    }
                }
                error!(order_id = %id, error = %e, "Order mutation failed, rolled back");
                Err(e)
            }
        }
    }

    /// Phase 3: mark everything stale and refetch every held query.
    pub async fn reconcile(&self) {
        self.inner.reconcile_scheduled.store(false, Ordering::SeqCst);
        self.invalidate_all();
        let keys: Vec<QueryKey> = lock(&self.inner.entries).keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.fetch(&key).await {
                warn!(error = %e, "Reconciling refetch failed; entry stays stale");
            }
        }
    }

    /// Run [`reconcile`](Self::reconcile) once the staleness window elapses.
    /// Requests made while one is already scheduled share it.
    pub fn schedule_reconcile(&self) {
        if self.inner.reconcile_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cache.inner.staleness_window).await;
            cache.reconcile().await;
        });
    }

    /// Apply, commit and schedule reconciliation for an arbitrary patch.
    pub async fn mutate(&self, id: &OrderId, patch: OrderPatch) -> Result<MutationOutcome> {
        let pending = match self.apply(id, patch) {
            Ok(pending) => pending,
            Err(Error::MutationInFlight(_)) => {
                info!(order_id = %id, "Mutation already in flight, ignoring duplicate");
                return Ok(MutationOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        let result = self.commit(pending).await;
        self.schedule_reconcile();
        result.map(|_| MutationOutcome::Applied)
    }

    pub async fn mutate_status(&self, id: &OrderId, status: OrderStatus) -> Result<MutationOutcome> {
        self.mutate(id, OrderPatch::status(status)).await
    }

    pub async fn mutate_payment_method(
        &self,
        id: &OrderId,
        kind: PaymentType,
    ) -> Result<MutationOutcome> {
        self.mutate(
            id,
            OrderPatch {
                type_of_payment: Some(kind),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete on the server, then drop the row locally. Not optimistic: the
    /// operation is irreversible, so nothing is removed before it succeeds.
    pub async fn delete(&self, id: &OrderId) -> Result<()> {
        if self.is_in_flight(id) {
            return Err(Error::MutationInFlight(id.clone()));
        }
        self.inner.store.delete_order(id).await?;
        for entry in lock(&self.inner.entries).values() {
            let before = entry.current();
            if before.iter().any(|o| &o.id == id) {
                let after: Vec<Order> = before.iter().filter(|o| &o.id != id).cloned().collect();
                entry.publish(Arc::new(after));
            }
        }
        self.schedule_reconcile();
        Ok(())
    }

    // -- push ingestion -----------------------------------------------------

    /// Fold a push event into the cache.
    ///
    /// `order:new` upserts the full order into every entry whose query admits
    /// it. Partial updates patch the cached order unless their `updatedAt` is
    /// older than what the cache holds. Events for unknown orders, or that
    /// cannot be read, mark the cache stale and schedule a refetch.
    pub fn ingest(&self, envelope: &NotificationEnvelope) {
        let applied = match envelope.kind {
            EventKind::OrderNew => match envelope.full_order() {
                Some(order) => {
                    self.upsert(order);
                    true
                }
                None => self.ingest_projection(envelope, None),
            },
            EventKind::PaymentSuccess => self.ingest_projection(envelope, Some(true)),
            EventKind::OrderStatusUpdate => self.ingest_projection(envelope, None),
        };
        if !applied {
            debug!(event = %envelope.kind, "Push event not applicable, scheduling refetch");
            self.invalidate_all();
            self.schedule_reconcile();
        }
    }

    fn ingest_projection(&self, envelope: &NotificationEnvelope, payed: Option<bool>) -> bool {
        let Some(mut projection) = envelope.projection() else {
            return false;
        };
        if payed.is_some() {
            projection.patch.payed = payed;
        }

        let entries = lock(&self.inner.entries);
        let mut seen = false;
        for entry in entries.values() {
            let before = entry.current();
            let Some(pos) = before.iter().position(|o| o.id == projection.id) else {
                continue;
            };
            seen = true;
            let held = &before[pos];
            if matches!(projection.updated_at, Some(at) if at < held.updated_at) {
                debug!(order_id = %projection.id, "Ignoring out-of-date push update");
                continue;
            }
            let mut patched = projection.patch.applied_to(held);
            if let Some(at) = projection.updated_at {
                patched.updated_at = at;
            }
            if &patched == held {
                continue;
            }
            let mut after = Vec::clone(&before);
            after[pos] = patched;
            entry.publish(Arc::new(after));
        }
        seen
    }

    fn upsert(&self, order: Order) {
        let entries = lock(&self.inner.entries);
        for (key, entry) in entries.iter() {
            let before = entry.current();
            let mut after = Vec::clone(&before);
            match after.iter().position(|o| o.id == order.id) {
                Some(pos) if after[pos].updated_at > order.updated_at => continue,
                Some(pos) => after[pos] = order.clone(),
                None if query_admits(key, &order) => after.insert(0, order.clone()),
                None => continue,
            }
            entry.publish(Arc::new(after));
        }
    }

    fn replace_order(&self, order: &Order) {
        let entries = lock(&self.inner.entries);
        for entry in entries.values() {
            let before = entry.current();
            if let Some(pos) = before.iter().position(|o| o.id == order.id) {
                let mut after = Vec::clone(&before);
                after[pos] = order.clone();
                entry.publish(Arc::new(after));
            }
        }
    }
}

/// Whether a pushed new order belongs in the entry for `query`. Only the
/// first page of a query takes new rows.
fn query_admits(query: &QueryKey, order: &Order) -> bool {
    query.page.map(|p| p <= 1).unwrap_or(true)
        && query.status.map(|s| s == order.status).unwrap_or(true)
        && query.payed.map(|p| p == order.is_paid()).unwrap_or(true)
        && query
            .delivery_options
            .map(|d| d == order.delivery_options)
            .unwrap_or(true)
        && query
            .type_of_payment
            .map(|k| order.type_of_payment.matches_filter(k))
            .unwrap_or(true)
}
