//! In-memory fakes shared by the unit tests.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::channel::{AlertPlayer, PushConnection, PushTransport, RoomCommand, TransportEvent};
use crate::error::{Error, Result};
use crate::lock;
use crate::models::{
    CartLine, CartSnapshot, CustomerRef, DeliveryOption, NewOrder, Order, OrderId, OrderPatch,
    OrderStatus, PaymentType, TableRef, TableStatus,
};
use crate::navigation::Navigator;
use crate::store::{CartStore, ListQuery, OrderStore, TableStore};
use crate::wire::OrderPage;

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Order builder
// ---------------------------------------------------------------------------

pub struct OrderBuilder(Order);

pub fn order(id: &str) -> OrderBuilder {
    OrderBuilder(Order {
        id: OrderId::from(id),
        status: OrderStatus::Pending,
        payed: false,
        delivery_options: DeliveryOption::Pickup,
        type_of_payment: PaymentType::Cash,
        total_price: 0.0,
        created_at: fixed_time(),
        updated_at: fixed_time(),
        booking_time: None,
        check_in_time: None,
        check_out_time: None,
        customer: None,
        table: None,
        cart: None,
        delivery_address: None,
    })
}

impl OrderBuilder {
    pub fn status(mut self, status: OrderStatus) -> Self {
        self.0.status = status;
        self
    }

    pub fn payed(mut self, payed: bool) -> Self {
        self.0.payed = payed;
        self
    }

    pub fn delivery(mut self, option: DeliveryOption) -> Self {
        self.0.delivery_options = option;
        self
    }

    pub fn payment(mut self, kind: PaymentType) -> Self {
        self.0.type_of_payment = kind;
        self
    }

    pub fn total(mut self, total: f64) -> Self {
        self.0.total_price = total;
        self
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.0.created_at = at;
        self
    }

    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.0.updated_at = at;
        self
    }

    pub fn line(mut self, dish: &str, quantity: u32, unit_price: f64) -> Self {
        let cart_id = format!("cart-{}", self.0.id);
        self.0
            .cart
            .get_or_insert_with(|| CartSnapshot {
                id: cart_id,
                lines: Vec::new(),
            })
            .lines
            .push(CartLine {
                dish_id: dish.to_string(),
                dish_name: dish.to_string(),
                quantity,
                unit_price,
            });
        self
    }

    pub fn build(self) -> Order {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    List,
    Get(OrderId),
    Create(NewOrder),
    Update(OrderId, OrderPatch),
    UpdateStatus(OrderId, OrderStatus),
    UpdatePaymentMethod(OrderId, PaymentType),
    ConfirmPayment(OrderId, String),
    Delete(OrderId),
    PaymentLink(String, OrderId),
    SetTable(String, TableStatus),
    ClearCart(String),
}

#[derive(Default)]
struct StoreState {
    orders: Vec<Order>,
    calls: Vec<StoreCall>,
    failures: HashMap<&'static str, Error>,
    delay: Duration,
    payment_link: Option<String>,
    next_id: u64,
}

/// Order service double. Every call is recorded, waits the configured delay,
/// then fails if a failure is armed for its operation name.
#[derive(Default)]
pub struct FakeOrderStore {
    state: Mutex<StoreState>,
}

impl FakeOrderStore {
    pub fn with_orders(orders: Vec<Order>) -> Self {
        let store = Self::default();
        lock(&store.state).orders = orders;
        store
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    /// Make `op` fail with `error` until [`FakeOrderStore::clear_failures`].
    pub fn fail(&self, op: &'static str, error: Error) {
        lock(&self.state).failures.insert(op, error);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    pub fn set_payment_link(&self, link: Option<String>) {
        lock(&self.state).payment_link = link;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    /// Change server-side state behind the cache's back.
    pub fn edit(&self, id: &OrderId, f: impl FnOnce(&mut Order)) {
        if let Some(order) = lock(&self.state).orders.iter_mut().find(|o| &o.id == id) {
            f(order);
        }
    }

    pub fn server_order(&self, id: &OrderId) -> Option<Order> {
        lock(&self.state).orders.iter().find(|o| &o.id == id).cloned()
    }

    async fn begin(&self, op: &'static str, call: StoreCall) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push(call);
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.state).failures.get(op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn modify(&self, id: &OrderId, f: impl FnOnce(&mut Order)) -> Result<Order> {
        let mut state = lock(&self.state);
        let order = state
            .orders
            .iter_mut()
            .find(|o| &o.id == id)
            .ok_or_else(|| Error::NotFound(format!("order {id}")))?;
        f(order);
        Ok(order.clone())
    }
}

fn listed(order: &Order, query: &ListQuery) -> bool {
    query.status.map(|s| s == order.status).unwrap_or(true)
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

impl OrderStore for FakeOrderStore {
    async fn list_orders(&self, query: &ListQuery) -> Result<OrderPage> {
        self.begin("list_orders", StoreCall::List).await?;
        let matching: Vec<Order> = lock(&self.state)
            .orders
            .iter()
            .filter(|o| listed(o, query))
            .cloned()
            .collect();
        let total = matching.len() as u64;
        let limit = query.limit.unwrap_or(0) as usize;
        if limit == 0 {
            return Ok(OrderPage {
                orders: matching,
                total_pages: 1,
                current_page: 1,
                total,
            });
        }
        let page = query.page.unwrap_or(1).max(1);
        let orders = matching
            .into_iter()
            .skip((page as usize - 1) * limit)
            .take(limit)
            .collect();
        Ok(OrderPage {
            orders,
            total_pages: (total as usize).div_ceil(limit).max(1) as u32,
            current_page: page,
            total,
        })
    }

    async fn get_order(&self, id: &OrderId) -> Result<Order> {
        self.begin("get_order", StoreCall::Get(id.clone())).await?;
        self.server_order(id)
            .ok_or_else(|| Error::NotFound(format!("order {id}")))
    }

    async fn create_order(&self, new: &NewOrder) -> Result<Order> {
        self.begin("create_order", StoreCall::Create(new.clone())).await?;
        let mut state = lock(&self.state);
        state.next_id += 1;
        let created = Order {
            id: OrderId::from(format!("ord-{}", state.next_id)),
            status: OrderStatus::Pending,
            payed: false,
            delivery_options: new.delivery_options,
            type_of_payment: new.type_of_payment,
            total_price: new.total_price,
            created_at: fixed_time(),
            updated_at: fixed_time(),
            booking_time: new.booking_time,
            check_in_time: None,
            check_out_time: None,
            customer: Some(CustomerRef {
                id: String::new(),
                name: Some(new.name.clone()),
                email: Some(new.email.clone()),
                phone: Some(new.phone.clone()),
            }),
            table: new.table.as_ref().map(|id| TableRef {
                id: id.clone(),
                ..Default::default()
            }),
            cart: Some(CartSnapshot {
                id: new.cart.clone(),
                lines: Vec::new(),
            }),
            delivery_address: new.delivery_address.clone(),
        };
        state.orders.push(created.clone());
        Ok(created)
    }

    async fn update_order(&self, id: &OrderId, patch: &OrderPatch) -> Result<Option<Order>> {
        self.begin("update_order", StoreCall::Update(id.clone(), patch.clone()))
            .await?;
        self.modify(id, |o| *o = patch.applied_to(o)).map(Some)
    }

    async fn update_status(&self, id: &OrderId, status: OrderStatus) -> Result<Option<Order>> {
        self.begin("update_status", StoreCall::UpdateStatus(id.clone(), status))
            .await?;
        self.modify(id, |o| o.status = status).map(Some)
    }

    async fn update_payment_method(&self, id: &OrderId, kind: PaymentType) -> Result<Option<Order>> {
        self.begin(
            "update_payment_method",
            StoreCall::UpdatePaymentMethod(id.clone(), kind),
        )
        .await?;
        self.modify(id, |o| o.type_of_payment = kind).map(Some)
    }

    async fn confirm_payment(&self, id: &OrderId, email: &str) -> Result<()> {
        self.begin(
            "confirm_payment",
            StoreCall::ConfirmPayment(id.clone(), email.to_string()),
        )
        .await?;
        self.modify(id, |o| o.payed = true).map(|_| ())
    }

    async fn delete_order(&self, id: &OrderId) -> Result<()> {
        self.begin("delete", StoreCall::Delete(id.clone())).await?;
        let mut state = lock(&self.state);
        let before = state.orders.len();
        state.orders.retain(|o| &o.id != id);
        if state.orders.len() == before {
            return Err(Error::NotFound(format!("order {id}")));
        }
        Ok(())
    }

    async fn create_payment_link(&self, email: &str, id: &OrderId) -> Result<Option<String>> {
        self.begin(
            "create_payment_link",
            StoreCall::PaymentLink(email.to_string(), id.clone()),
        )
        .await?;
        Ok(lock(&self.state).payment_link.clone())
    }
}

impl TableStore for FakeOrderStore {
    async fn set_table_status(&self, table_id: &str, status: TableStatus) -> Result<()> {
        self.begin(
            "set_table_status",
            StoreCall::SetTable(table_id.to_string(), status),
        )
        .await
    }
}

impl CartStore for FakeOrderStore {
    async fn clear_cart(&self, cart_id: &str) -> Result<()> {
        self.begin("clear_cart", StoreCall::ClearCart(cart_id.to_string()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Push transport
// ---------------------------------------------------------------------------

struct FakeLink {
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
}

struct TransportState {
    healthy: AtomicBool,
    opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    links: Mutex<Vec<FakeLink>>,
}

/// Scriptable push server. Each successful `open` creates a link whose room
/// commands can be inspected and into which events can be injected.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<TransportState>,
}

impl FakeTransport {
    fn build(healthy: bool) -> Self {
        Self {
            inner: Arc::new(TransportState {
                healthy: AtomicBool::new(healthy),
                opens: AtomicUsize::new(0),
                open_delay: Mutex::new(Duration::ZERO),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn healthy() -> Self {
        Self::build(true)
    }

    pub fn failing() -> Self {
        Self::build(false)
    }

    pub fn with_open_delay(self, delay: Duration) -> Self {
        *lock(&self.inner.open_delay) = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Connection attempts so far, successful or not.
    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Drain the room commands received on the `link`-th connection.
    pub fn commands(&self, link: usize) -> Vec<RoomCommand> {
        let mut links = lock(&self.inner.links);
        let mut drained = Vec::new();
        if let Some(link) = links.get_mut(link) {
            while let Ok(command) = link.commands.try_recv() {
                drained.push(command);
            }
        }
        drained
    }

    fn latest_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        lock(&self.inner.links).last().map(|l| l.events.clone())
    }

    pub async fn emit(&self, event: &str, payload: Value) {
        if let Some(sender) = self.latest_sender() {
            let _ = sender
                .send(TransportEvent::Message {
                    event: event.to_string(),
                    payload,
                })
                .await;
        }
    }

    /// Server-side close of the current connection.
    pub async fn drop_link(&self, reason: &str) {
        if let Some(sender) = self.latest_sender() {
            let _ = sender
                .send(TransportEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

impl PushTransport for FakeTransport {
    async fn open(&self) -> Result<PushConnection> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.inner.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.inner.healthy.load(Ordering::SeqCst) {
            return Err(Error::Channel("connection refused".into()));
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        lock(&self.inner.links).push(FakeLink {
            events: event_tx,
            commands: command_rx,
        });
        Ok(PushConnection {
            events: event_rx,
            commands: command_tx,
        })
    }

    fn description(&self) -> String {
        "fake://push".to_string()
    }
}

// ---------------------------------------------------------------------------
// Alert and navigation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingAlertPlayer {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingAlertPlayer {
    /// `(starts, stops)`.
    pub fn counts(&self) -> (usize, usize) {
        (
            self.starts.load(Ordering::SeqCst),
            self.stops.load(Ordering::SeqCst),
        )
    }
}

impl AlertPlayer for RecordingAlertPlayer {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingNavigator {
    opened: Arc<Mutex<Vec<String>>>,
}

impl RecordingNavigator {
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &str) -> Result<()> {
        lock(&self.opened).push(url.to_string());
        Ok(())
    }
}
