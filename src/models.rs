//! Domain types for the order lifecycle.
//!
//! These mirror the order service's JSON (camelCase, Mongo-style `_id`
//! aliases) and carry the small amount of behaviour that belongs to the data
//! itself: the status machine, the derived "paid" flag, and cart totals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, server-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self(value.trim().to_string())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Order status machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Whether an admin may move an order from `self` to `next`.
    ///
    /// Terminal states are final. Among non-terminal states regressions such
    /// as `confirmed -> pending` are allowed; the order service has the last
    /// word on whether it accepts them.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        !self.is_terminal() || self == next
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "new" => Ok(OrderStatus::Pending),
            "confirmed" | "approved" | "accepted" => Ok(OrderStatus::Confirmed),
            "completed" | "done" | "delivered" => Ok(OrderStatus::Completed),
            "cancelled" | "canceled" | "rejected" | "declined" => Ok(OrderStatus::Cancelled),
            other => Err(format!("Unknown order status: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Delivery and payment enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryOption {
    #[serde(rename = "dine-in", alias = "dine_in", alias = "dinein")]
    DineIn,
    #[serde(rename = "delivery")]
    Delivery,
    #[serde(rename = "pickup", alias = "takeaway", alias = "take-away")]
    Pickup,
}

impl DeliveryOption {
    pub const ALL: [DeliveryOption; 3] = [
        DeliveryOption::DineIn,
        DeliveryOption::Delivery,
        DeliveryOption::Pickup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOption::DineIn => "dine-in",
            DeliveryOption::Delivery => "delivery",
            DeliveryOption::Pickup => "pickup",
        }
    }
}

impl fmt::Display for DeliveryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the customer pays. `Cod` is the legacy spelling some orders still
/// carry for cash on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum PaymentType {
    Cash,
    Cod,
    Card,
    Momo,
    #[default]
    Unset,
}

impl PaymentType {
    pub const ALL: [PaymentType; 5] = [
        PaymentType::Cash,
        PaymentType::Cod,
        PaymentType::Card,
        PaymentType::Momo,
        PaymentType::Unset,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentType::Cash => "cash",
            PaymentType::Cod => "cod",
            PaymentType::Card => "card",
            PaymentType::Momo => "momo",
            PaymentType::Unset => "",
        }
    }

    /// Payment settled in person; no gateway round trip.
    pub fn is_cash_like(self) -> bool {
        matches!(self, PaymentType::Cash | PaymentType::Cod)
    }

    /// Payment that goes through the hosted MoMo page. Card orders are
    /// recorded but have no checkout gateway.
    pub fn is_gateway(self) -> bool {
        matches!(self, PaymentType::Momo)
    }

    /// Filter semantics: a `cod` filter also matches legacy `cash` orders.
    pub fn matches_filter(self, wanted: PaymentType) -> bool {
        match wanted {
            PaymentType::Cod => self.is_cash_like(),
            other => self == other,
        }
    }
}

impl From<Option<String>> for PaymentType {
    fn from(raw: Option<String>) -> Self {
        match raw
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default()
            .as_str()
        {
            "cash" => PaymentType::Cash,
            "cod" | "cash_on_delivery" => PaymentType::Cod,
            "card" | "credit_card" | "visa" => PaymentType::Card,
            "momo" | "momo_wallet" => PaymentType::Momo,
            _ => PaymentType::Unset,
        }
    }
}

impl From<PaymentType> for String {
    fn from(value: PaymentType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentType::Unset => f.write_str("unset"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
}

// ---------------------------------------------------------------------------
// References and cart snapshot
// ---------------------------------------------------------------------------

/// The order service returns related documents either as a bare id or
/// populated; both collapse into the same reference type.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRef<T> {
    Id(String),
    Populated(T),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRef {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TableStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[serde(alias = "dish", deserialize_with = "de_dish_id")]
    pub dish_id: String,
    #[serde(default, alias = "name")]
    pub dish_name: String,
    pub quantity: u32,
    #[serde(alias = "price")]
    pub unit_price: f64,
}

impl CartLine {
    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

/// Immutable copy of the cart the order was placed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSnapshot {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "items", alias = "dishes")]
    pub lines: Vec<CartLine>,
}

impl CartSnapshot {
    pub fn total(&self) -> f64 {
        self.lines.iter().map(CartLine::line_total).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() || self.lines.iter().all(|l| l.quantity == 0)
    }
}

fn de_ref<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + From<String>,
{
    let raw = Option::<RawRef<T>>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawRef::Id(id)) if id.trim().is_empty() => None,
        Some(RawRef::Id(id)) => Some(T::from(id)),
        Some(RawRef::Populated(v)) => Some(v),
        None => None,
    })
}

fn de_dish_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    match &raw {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Object(_) => crate::value_str(&raw, &["_id", "id"])
            .ok_or_else(|| serde::de::Error::custom("dish reference without id")),
        _ => Err(serde::de::Error::custom("dish reference must be id or object")),
    }
}

impl From<String> for CustomerRef {
    fn from(id: String) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

impl From<String> for TableRef {
    fn from(id: String) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

impl From<String> for CartSnapshot {
    fn from(id: String) -> Self {
        Self {
            id,
            lines: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(alias = "_id")]
    pub id: OrderId,
    pub status: OrderStatus,
    #[serde(default)]
    pub payed: bool,
    pub delivery_options: DeliveryOption,
    #[serde(default)]
    pub type_of_payment: PaymentType,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_out_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "user", deserialize_with = "de_ref")]
    pub customer: Option<CustomerRef>,
    #[serde(default, deserialize_with = "de_ref", skip_serializing_if = "Option::is_none")]
    pub table: Option<TableRef>,
    #[serde(default, deserialize_with = "de_ref")]
    pub cart: Option<CartSnapshot>,
    #[serde(default, alias = "address", skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
}

impl Order {
    /// Paid is derived: the explicit flag, or a status that implies money
    /// changed hands.
    pub fn is_paid(&self) -> bool {
        self.payed || matches!(self.status, OrderStatus::Confirmed | OrderStatus::Completed)
    }

    /// Dish lines of the attached cart snapshot, empty when not populated.
    pub fn lines(&self) -> &[CartLine] {
        self.cart.as_ref().map(|c| c.lines.as_slice()).unwrap_or(&[])
    }
}

/// Field-level changes to an order. Used both for update requests and for
/// applying partial projections that arrive over the push channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_of_payment: Option<PaymentType>,
    #[serde(default, alias = "address", skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_out_time: Option<DateTime<Utc>>,
}

impl OrderPatch {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &OrderPatch::default()
    }

    /// Produce the patched copy of `order`; the original is left untouched.
    pub fn applied_to(&self, order: &Order) -> Order {
        let mut next = order.clone();
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(payed) = self.payed {
            next.payed = payed;
        }
        if let Some(kind) = self.type_of_payment {
            next.type_of_payment = kind;
        }
        if let Some(addr) = &self.delivery_address {
            next.delivery_address = Some(addr.clone());
        }
        if self.booking_time.is_some() {
            next.booking_time = self.booking_time;
        }
        if self.check_in_time.is_some() {
            next.check_in_time = self.check_in_time;
        }
        if self.check_out_time.is_some() {
            next.check_out_time = self.check_out_time;
        }
        next
    }
}

/// Partial order as delivered by push events: an id, an optional version
/// stamp and whatever fields changed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProjection {
    #[serde(alias = "_id", alias = "orderId")]
    pub id: OrderId,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub patch: OrderPatch,
}

// ---------------------------------------------------------------------------
// Checkout input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Body of the create-order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub cart: String,
    pub total_price: f64,
    pub delivery_options: DeliveryOption,
    pub type_of_payment: PaymentType,
    pub name: String,
    pub email: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Push notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderNew,
    PaymentSuccess,
    OrderStatusUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::OrderNew,
        EventKind::PaymentSuccess,
        EventKind::OrderStatusUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::OrderNew => "order:new",
            EventKind::PaymentSuccess => "payment:success",
            EventKind::OrderStatusUpdate => "order:statusUpdate",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "order:new" => Ok(EventKind::OrderNew),
            "payment:success" => Ok(EventKind::PaymentSuccess),
            "order:statusUpdate" => Ok(EventKind::OrderStatusUpdate),
            other => Err(format!("Unknown event: {other}")),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit delivered over the notification channel. No sequence number and no
/// delivery guarantee: consumers must tolerate duplicates and reordering.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEnvelope {
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEnvelope {
    /// The full order carried by the event, when the payload is complete.
    pub fn full_order(&self) -> Option<Order> {
        let candidate = self.data.get("order").unwrap_or(&self.data);
        serde_json::from_value(candidate.clone()).ok()
    }

    /// The partial order carried by the event.
    pub fn projection(&self) -> Option<OrderProjection> {
        let candidate = self.data.get("order").unwrap_or(&self.data);
        serde_json::from_value(candidate.clone()).ok()
    }

    pub fn order_id(&self) -> Option<OrderId> {
        let candidate = self.data.get("order").unwrap_or(&self.data);
        crate::value_str(candidate, &["_id", "id", "orderId"]).map(OrderId::from)
    }
}
