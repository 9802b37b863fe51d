//! Boundary parsers for the shapes the order service, payment gateway and
//! push channel actually send.
//!
//! Each parser tries the known shapes in a fixed priority order and fails
//! closed with [`Error::Decode`] when none match, so business logic only ever
//! sees normalised types.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::{EventKind, NotificationEnvelope, Order, OrderId};

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// `{ message, statusCode, metadata }` as returned by every order endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub metadata: Value,
}

/// Unwrap the response envelope. A body-level `statusCode` of 400 or above
/// is treated as a failure even when the HTTP status was 2xx.
pub fn unwrap_envelope(body: Value) -> Result<Envelope> {
    if !body.is_object() {
        return Err(Error::Decode("response body is not an object".into()));
    }
    let envelope: Envelope = serde_json::from_value(body)?;
    if let Some(code) = envelope.status_code {
        if code >= 400 {
            return Err(Error::service(code, envelope.message));
        }
    }
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Order metadata shapes
// ---------------------------------------------------------------------------

/// Normalised page of orders, whatever shape the metadata had.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total_pages: u32,
    pub current_page: u32,
    pub total: u64,
}

impl OrderPage {
    fn from_orders(orders: Vec<Order>) -> Self {
        let total = orders.len() as u64;
        Self {
            orders,
            total_pages: 1,
            current_page: 1,
            total,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WrappedOrders {
    orders: Vec<Order>,
    #[serde(default)]
    total_pages: Option<u32>,
    #[serde(default)]
    current_page: Option<u32>,
    #[serde(default)]
    total: Option<u64>,
}

/// The metadata variants the order endpoints produce.
#[derive(Debug, Clone, PartialEq)]
pub enum OrdersMetadata {
    List(Vec<Order>),
    Page(OrderPage),
    Single(Box<Order>),
}

impl OrdersMetadata {
    /// Try array, then wrapped object, then single order.
    pub fn parse(metadata: &Value) -> Result<Self> {
        if metadata.is_array() {
            let orders: Vec<Order> = serde_json::from_value(metadata.clone())
                .map_err(|e| Error::Decode(format!("order list: {e}")))?;
            return Ok(OrdersMetadata::List(orders));
        }
        if metadata.get("orders").map(Value::is_array).unwrap_or(false) {
            let wrapped: WrappedOrders = serde_json::from_value(metadata.clone())
                .map_err(|e| Error::Decode(format!("order page: {e}")))?;
            let total = wrapped.total.unwrap_or(wrapped.orders.len() as u64);
            return Ok(OrdersMetadata::Page(OrderPage {
                total_pages: wrapped.total_pages.unwrap_or(1),
                current_page: wrapped.current_page.unwrap_or(1),
                total,
                orders: wrapped.orders,
            }));
        }
        if metadata.is_object() {
            let order: Order = serde_json::from_value(metadata.clone())
                .map_err(|e| Error::Decode(format!("order: {e}")))?;
            return Ok(OrdersMetadata::Single(Box::new(order)));
        }
        Err(Error::Decode(format!(
            "metadata is neither an order, a list nor a page: {metadata}"
        )))
    }

    pub fn into_page(self) -> OrderPage {
        match self {
            OrdersMetadata::List(orders) => OrderPage::from_orders(orders),
            OrdersMetadata::Page(page) => page,
            OrdersMetadata::Single(order) => OrderPage::from_orders(vec![*order]),
        }
    }

    pub fn into_single(self) -> Result<Order> {
        match self {
            OrdersMetadata::Single(order) => Ok(*order),
            OrdersMetadata::List(mut orders) | OrdersMetadata::Page(OrderPage { mut orders, .. })
                if orders.len() == 1 =>
            {
                Ok(orders.remove(0))
            }
            other => Err(Error::Decode(format!(
                "expected a single order, got {} orders",
                other.into_page().orders.len()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payment link
// ---------------------------------------------------------------------------

/// Where known gateways put the redirect URL, most specific first.
const PAYMENT_URL_POINTERS: &[&str] = &[
    "/metadata/payUrl",
    "/metadata/data/payUrl",
    "/metadata/paymentUrl",
    "/metadata/checkoutUrl",
    "/metadata/url",
    "/data/payUrl",
    "/payUrl",
    "/paymentUrl",
    "/url",
    "/metadata/shortLink",
    "/metadata/deeplink",
];

/// Probe the payment-link response for a usable http(s) redirect URL.
pub fn extract_payment_url(body: &Value) -> Option<String> {
    PAYMENT_URL_POINTERS.iter().find_map(|pointer| {
        body.pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| s.starts_with("https://") || s.starts_with("http://"))
            .map(str::to_string)
    })
}

// ---------------------------------------------------------------------------
// Gateway return redirect
// ---------------------------------------------------------------------------

/// Proof-of-payment parameters carried by the gateway's return redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReturn {
    pub order_id: OrderId,
    pub result_code: Option<String>,
    pub transaction_id: Option<String>,
    pub message: Option<String>,
}

impl GatewayReturn {
    /// The gateway explicitly reported a failed payment: a numeric result
    /// code other than zero. MoMo sends `0`, VNPay `00`.
    pub fn is_declined(&self) -> bool {
        self.result_code
            .as_deref()
            .and_then(|code| code.trim().parse::<i64>().ok())
            .is_some_and(|code| code != 0)
    }
}

fn first_non_empty(params: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        params
            .get(*k)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

/// Parse the return redirect. `input` may be a full URL or a bare query
/// string; `candidates` lists order-id parameter names by priority.
pub fn parse_gateway_return(input: &str, candidates: &[String]) -> Result<GatewayReturn> {
    let trimmed = input.trim();
    let query = match Url::parse(trimmed) {
        Ok(url) => url.query().unwrap_or_default().to_string(),
        Err(_) => trimmed.trim_start_matches('?').to_string(),
    };
    let params: HashMap<String, String> = url_query_pairs(&query);

    let order_id = candidates
        .iter()
        .find_map(|name| {
            params
                .get(name.as_str())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        })
        .map(OrderId::from)
        .ok_or_else(|| {
            Error::Decode(format!(
                "gateway return carries none of the order id parameters {candidates:?}"
            ))
        })?;

    Ok(GatewayReturn {
        order_id,
        result_code: first_non_empty(&params, &["resultCode", "errorCode", "vnp_ResponseCode"]),
        transaction_id: first_non_empty(&params, &["transId", "transactionId", "vnp_TransactionNo"]),
        message: first_non_empty(&params, &["message", "localMessage"]),
    })
}

fn url_query_pairs(query: &str) -> HashMap<String, String> {
    // Parse through Url so percent-decoding matches what browsers send.
    match Url::parse(&format!("http://gateway.invalid/?{query}")) {
        Ok(url) => url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        Err(_) => HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

/// Decode a raw push event into a [`NotificationEnvelope`].
///
/// The payload is either the envelope itself (`{ type, data, timestamp }`)
/// or the bare order projection; both are accepted.
pub fn decode_push_event(event: &str, payload: Value) -> Result<NotificationEnvelope> {
    let kind: EventKind = event.parse().map_err(Error::Decode)?;

    let is_envelope = payload.get("data").is_some()
        && (payload.get("type").is_some() || payload.get("timestamp").is_some());
    let (data, timestamp) = if is_envelope {
        let timestamp = payload
            .get("timestamp")
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        (payload.get("data").cloned().unwrap_or(Value::Null), timestamp)
    } else {
        (payload, Utc::now())
    };

    if !data.is_object() {
        return Err(Error::Decode(format!("{event} payload is not an object")));
    }

    Ok(NotificationEnvelope {
        kind,
        data,
        timestamp,
    })
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = v.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
