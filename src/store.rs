//! Order Store Client.
//!
//! Stateless request functions against the external order service. Inputs
//! are validated by the service, not here; this layer shapes requests and
//! unwraps the `{ message, statusCode, metadata }` envelope into typed
//! values. No retries: callers own retry policy.
//!
//! The traits are the seam the cache and checkout depend on, so both can run
//! against an in-memory store in tests.

use reqwest::Method;
use serde_json::{json, Value};
use std::future::Future;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ConnectivityResult};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::models::{
    DeliveryOption, NewOrder, Order, OrderId, OrderPatch, OrderStatus, PaymentType, TableStatus,
};
use crate::wire::{self, OrderPage, OrdersMetadata};

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// List parameters. The service treats the filters as advisory; the console
/// fetches unfiltered and filters client-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<OrderStatus>,
    pub payed: Option<bool>,
    pub delivery_options: Option<DeliveryOption>,
    pub type_of_payment: Option<PaymentType>,
}

impl ListQuery {
    /// Everything, unfiltered: the admin view's query.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(page) = self.page {
            params.push(("page", page.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(status) = self.status {
            params.push(("status", status.as_str().to_string()));
        }
        if let Some(payed) = self.payed {
            params.push(("payed", payed.to_string()));
        }
        if let Some(option) = self.delivery_options {
            params.push(("deliveryOptions", option.as_str().to_string()));
        }
        if let Some(kind) = self.type_of_payment.filter(|k| *k != PaymentType::Unset) {
            params.push(("typeOfPayment", kind.as_str().to_string()));
        }
        params
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait OrderStore: Send + Sync + 'static {
    fn list_orders(&self, query: &ListQuery) -> impl Future<Output = Result<OrderPage>> + Send;

    fn get_order(&self, id: &OrderId) -> impl Future<Output = Result<Order>> + Send;

    fn create_order(&self, order: &NewOrder) -> impl Future<Output = Result<Order>> + Send;

    /// General field update. Returns the updated order when the service
    /// echoes it back.
    fn update_order(
        &self,
        id: &OrderId,
        patch: &OrderPatch,
    ) -> impl Future<Output = Result<Option<Order>>> + Send;

    fn update_status(
        &self,
        id: &OrderId,
        status: OrderStatus,
    ) -> impl Future<Output = Result<Option<Order>>> + Send;

    fn update_payment_method(
        &self,
        id: &OrderId,
        kind: PaymentType,
    ) -> impl Future<Output = Result<Option<Order>>> + Send;

    /// Mark the order paid. Repeating the call with the same arguments is a
    /// no-op success.
    fn confirm_payment(&self, id: &OrderId, email: &str) -> impl Future<Output = Result<()>> + Send;

    /// Irreversible.
    fn delete_order(&self, id: &OrderId) -> impl Future<Output = Result<()>> + Send;

    /// Ask the gateway for a hosted payment page. `Ok(None)` when the
    /// service answered but carried no usable URL.
    fn create_payment_link(
        &self,
        email: &str,
        id: &OrderId,
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

pub trait TableStore: Send + Sync + 'static {
    fn set_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait CartStore: Send + Sync + 'static {
    fn clear_cart(&self, cart_id: &str) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP backend
// ---------------------------------------------------------------------------

fn order_path(id: &OrderId) -> String {
    format!("/api/orders/{}", id.as_str())
}

/// The service answers a second confirmation with 409 or a 400 carrying an
/// "already paid" message; both mean the first call landed.
fn is_already_confirmed(err: &Error) -> bool {
    match err {
        Error::Service { status: 409, .. } => true,
        Error::Service { status: 400, message } => {
            let lower = message.to_ascii_lowercase();
            lower.contains("already paid") || lower.contains("already confirmed")
        }
        _ => false,
    }
}

/// The order echoed by an update, if the service sent one back. The update
/// itself already succeeded, so an echo that is not an order is not an error.
fn optional_order(metadata: &Value) -> Option<Order> {
    if metadata.is_null() {
        return None;
    }
    match OrdersMetadata::parse(metadata).and_then(OrdersMetadata::into_single) {
        Ok(order) => Some(order),
        Err(e) => {
            debug!(error = %e, "Update echo is not an order; ignoring");
            None
        }
    }
}

/// Order service client over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    api: ApiClient,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }

    pub fn from_client(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn check_connectivity(&self) -> ConnectivityResult {
        self.api.check_connectivity().await
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let raw = self.api.request(method, path, query, body).await?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        Ok(wire::unwrap_envelope(raw)?.metadata)
    }
}

impl OrderStore for HttpBackend {
    async fn list_orders(&self, query: &ListQuery) -> Result<OrderPage> {
        let metadata = self
            .call(Method::GET, "/api/orders", &query.to_params(), None)
            .await?;
        let page = OrdersMetadata::parse(&metadata)?.into_page();
        debug!(count = page.orders.len(), total = page.total, "Fetched orders");
        Ok(page)
    }

    async fn get_order(&self, id: &OrderId) -> Result<Order> {
        let metadata = match self.call(Method::GET, &order_path(id), &[], None).await {
            Err(Error::Service { status: 404, .. }) => {
                return Err(Error::NotFound(format!("order {id}")))
            }
            other => other?,
        };
        if metadata.is_null() {
            return Err(Error::NotFound(format!("order {id}")));
        }
        OrdersMetadata::parse(&metadata)?.into_single()
    }

    async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        let body = serde_json::to_value(order)?;
        let metadata = self
            .call(Method::POST, "/api/orders", &[], Some(&body))
            .await?;
        let created = OrdersMetadata::parse(&metadata)?.into_single()?;
        info!(order_id = %created.id, total = created.total_price, "Order created");
        Ok(created)
    }

    async fn update_order(&self, id: &OrderId, patch: &OrderPatch) -> Result<Option<Order>> {
        let body = serde_json::to_value(patch)?;
        let metadata = self
            .call(Method::PATCH, &order_path(id), &[], Some(&body))
            .await?;
        Ok(optional_order(&metadata))
    }

    async fn update_status(&self, id: &OrderId, status: OrderStatus) -> Result<Option<Order>> {
        let body = json!({ "status": status.as_str() });
        let path = format!("{}/status", order_path(id));
        let metadata = self.call(Method::PATCH, &path, &[], Some(&body)).await?;
        Ok(optional_order(&metadata))
    }

    async fn update_payment_method(&self, id: &OrderId, kind: PaymentType) -> Result<Option<Order>> {
        let body = json!({ "typeOfPayment": kind.as_str() });
        let path = format!("{}/payment-method", order_path(id));
        let metadata = self.call(Method::PATCH, &path, &[], Some(&body)).await?;
        Ok(optional_order(&metadata))
    }

    async fn confirm_payment(&self, id: &OrderId, email: &str) -> Result<()> {
        let body = json!({ "orderId": id.as_str(), "email": email.trim() });
        match self
            .call(Method::POST, "/api/payment/confirm", &[], Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_confirmed(&e) => {
                debug!(order_id = %id, "Payment already confirmed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_order(&self, id: &OrderId) -> Result<()> {
        self.call(Method::DELETE, &order_path(id), &[], None).await?;
        info!(order_id = %id, "Order deleted");
        Ok(())
    }

    async fn create_payment_link(&self, email: &str, id: &OrderId) -> Result<Option<String>> {
        let body = json!({ "email": email.trim(), "orderId": id.as_str() });
        // The link lives anywhere in the body, so probe the raw response.
        let raw = self
            .api
            .request(Method::POST, "/api/payment/momo", &[], Some(&body))
            .await?;
        let url = wire::extract_payment_url(&raw);
        if url.is_none() {
            let probe = raw.get("metadata").unwrap_or(&raw);
            warn!(
                order_id = %id,
                result_code = crate::value_code(probe, &["resultCode", "errorCode"]).as_deref(),
                message = crate::value_str(probe, &["message", "localMessage"]).as_deref(),
                "Payment link response carried no redirect URL"
            );
        }
        Ok(url)
    }
}

impl TableStore for HttpBackend {
    async fn set_table_status(&self, table_id: &str, status: TableStatus) -> Result<()> {
        let body = json!({ "status": status });
        let path = format!("/api/tables/{}", table_id.trim());
        self.call(Method::PATCH, &path, &[], Some(&body)).await?;
        Ok(())
    }
}

impl CartStore for HttpBackend {
    async fn clear_cart(&self, cart_id: &str) -> Result<()> {
        let path = format!("/api/carts/{}", cart_id.trim());
        self.call(Method::DELETE, &path, &[], None).await?;
        Ok(())
    }
}
