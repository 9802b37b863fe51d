//! Checkout/Payment Orchestrator.
//!
//! Placing an order:
//!
//! 1. validate cart and contact details locally (no request on failure)
//! 2. create the order from the cart snapshot and its computed total
//! 3. dine-in: reserve the table, best effort
//! 4. cash/COD: clear the cart, done. Gateway: request a payment link; with
//!    a link, clear the cart and redirect; without one, fail and leave both
//!    the order and the cart as they are
//!
//! On the gateway's return redirect the order id is pulled from whichever
//! candidate parameter the gateway filled, payment is confirmed
//! idempotently, and success is reported even if that confirmation fails.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::config::CheckoutConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::models::{
    CartSnapshot, ContactInfo, DeliveryOption, NewOrder, Order, OrderId, PaymentType, TableStatus,
};
use crate::navigation::Navigator;
use crate::store::{CartStore, OrderStore, TableStore};
use crate::wire;

/// Everything the customer filled in at checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub cart: CartSnapshot,
    pub contact: ContactInfo,
    pub delivery_options: DeliveryOption,
    pub type_of_payment: PaymentType,
    pub table_id: Option<String>,
    pub delivery_address: Option<String>,
    pub booking_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    /// Cash or COD: the order is placed and the cart cleared.
    Placed { order: Order },
    /// Gateway payment: the customer was sent to `payment_url`. When the
    /// browser could not be opened, `redirected` is false and the host
    /// should show the link instead.
    AwaitingPayment {
        order: Order,
        payment_url: String,
        redirected: bool,
    },
}

impl CheckoutOutcome {
    pub fn order(&self) -> &Order {
        match self {
            CheckoutOutcome::Placed { order } | CheckoutOutcome::AwaitingPayment { order, .. } => {
                order
            }
        }
    }
}

/// Result of handling the gateway's return redirect. Always a success from
/// the payer's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub order_id: OrderId,
    /// The confirm call succeeded (now or earlier in this session).
    pub confirmed_remotely: bool,
    /// A previous return for the same order and email was already confirmed.
    pub repeated: bool,
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Local checks run before any request is issued.
pub fn validate(request: &CheckoutRequest) -> Result<()> {
    if request.cart.id.trim().is_empty() || request.cart.is_empty() {
        return Err(Error::Validation("Your cart is empty".into()));
    }
    let contact = &request.contact;
    if blank(&contact.name) || blank(&contact.email) || blank(&contact.phone) {
        return Err(Error::Validation(
            "Please enter your name, email and phone number".into(),
        ));
    }
    if !contact.email.contains('@') {
        return Err(Error::Validation("Please enter a valid email address".into()));
    }
    match request.delivery_options {
        DeliveryOption::DineIn if request.table_id.as_deref().map_or(true, blank) => {
            return Err(Error::Validation("Please choose a table".into()));
        }
        DeliveryOption::Delivery if request.delivery_address.as_deref().map_or(true, blank) => {
            return Err(Error::Validation("Please enter a delivery address".into()));
        }
        _ => {}
    }
    let kind = request.type_of_payment;
    if kind == PaymentType::Unset {
        return Err(Error::Validation("Please choose a payment method".into()));
    }
    if !kind.is_cash_like() && !kind.is_gateway() {
        return Err(Error::Validation(format!(
            "{kind} payments are not available at checkout"
        )));
    }
    Ok(())
}

pub struct CheckoutOrchestrator<S, N> {
    store: Arc<S>,
    navigator: N,
    config: CheckoutConfig,
    confirmed: Mutex<HashSet<(OrderId, String)>>,
}

impl<S, N> CheckoutOrchestrator<S, N>
where
    S: OrderStore + TableStore + CartStore,
    N: Navigator,
{
    pub fn new(store: Arc<S>, navigator: N, config: CheckoutConfig) -> Self {
        Self {
            store,
            navigator,
            config,
            confirmed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn place_order(&self, request: &CheckoutRequest) -> Result<CheckoutOutcome> {
        validate(request)?;

        let contact = &request.contact;
        let new_order = NewOrder {
            cart: request.cart.id.trim().to_string(),
            total_price: request.cart.total(),
            delivery_options: request.delivery_options,
            type_of_payment: request.type_of_payment,
            name: contact.name.trim().to_string(),
            email: contact.email.trim().to_string(),
            phone: contact.phone.trim().to_string(),
            table: match request.delivery_options {
                DeliveryOption::DineIn => request.table_id.as_deref().map(|t| t.trim().to_string()),
                _ => None,
            },
            delivery_address: match request.delivery_options {
                DeliveryOption::Delivery => request
                    .delivery_address
                    .as_deref()
                    .map(|a| a.trim().to_string()),
                _ => None,
            },
            booking_time: request.booking_time,
        };

        let order = self.store.create_order(&new_order).await.map_err(|e| {
            error!(error = %e, "Order creation failed");
            e
        })?;

        if let Some(table_id) = new_order.table.as_deref() {
            self.reserve_table(&order.id, table_id).await;
        }

        if request.type_of_payment.is_cash_like() {
            self.clear_cart(&request.cart.id).await;
            info!(order_id = %order.id, payment = %request.type_of_payment, "Order placed");
            return Ok(CheckoutOutcome::Placed { order });
        }

        let payment_url = match self
            .store
            .create_payment_link(&new_order.email, &order.id)
            .await
        {
            Ok(Some(url)) => url,
            Ok(None) => {
                error!(order_id = %order.id, "Payment link response had no URL; order left unpaid");
                return Err(Error::PaymentLinkUnavailable { order_id: order.id });
            }
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Payment link request failed; order left unpaid");
                return Err(Error::PaymentLinkUnavailable { order_id: order.id });
            }
        };

        self.clear_cart(&request.cart.id).await;
        let redirected = match self.navigator.redirect(&payment_url) {
            Ok(()) => true,
            Err(e) => {
                error!(order_id = %order.id, error = %e, "Could not open payment page");
                false
            }
        };
        info!(order_id = %order.id, payment = %request.type_of_payment, redirected, "Awaiting gateway payment");
        Ok(CheckoutOutcome::AwaitingPayment {
            order,
            payment_url,
            redirected,
        })
    }

    async fn reserve_table(&self, order_id: &OrderId, table_id: &str) {
        if let Err(e) = self
            .store
            .set_table_status(table_id, TableStatus::Reserved)
            .await
        {
            warn!(order_id = %order_id, table_id, error = %e, "Table reservation failed; order kept");
        }
    }

    async fn clear_cart(&self, cart_id: &str) {
        if let Err(e) = self.store.clear_cart(cart_id).await {
            warn!(cart_id, error = %e, "Failed to clear cart after order");
        }
    }

    /// Handle the gateway's return redirect (full URL or query string).
    ///
    /// Fails only when the redirect carries no order id or the gateway
    /// explicitly declined. A failing confirm call is logged and the
    /// payment is still reported as successful.
    pub async fn handle_gateway_return(
        &self,
        redirect: &str,
        email: &str,
    ) -> Result<PaymentConfirmation> {
        let proof = wire::parse_gateway_return(redirect, &self.config.gateway_return_params)?;
        let order_id = proof.order_id.clone();

        if proof.is_declined() {
            let code = proof.result_code.unwrap_or_default();
            warn!(order_id = %order_id, code = %code, message = proof.message.as_deref(), "Gateway declined payment");
            return Err(Error::GatewayDeclined { order_id, code });
        }

        let key = (order_id.clone(), email.trim().to_ascii_lowercase());
        if lock(&self.confirmed).contains(&key) {
            info!(order_id = %order_id, "Payment already confirmed this session");
            return Ok(PaymentConfirmation {
                order_id,
                confirmed_remotely: true,
                repeated: true,
            });
        }

        let confirmed_remotely = match self.store.confirm_payment(&order_id, email.trim()).await {
            Ok(()) => {
                lock(&self.confirmed).insert(key);
                info!(
                    order_id = %order_id,
                    transaction_id = proof.transaction_id.as_deref(),
                    "Payment confirmed"
                );
                true
            }
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Payment confirmation failed; reporting success, reconciliation deferred");
                false
            }
        };

        Ok(PaymentConfirmation {
            order_id,
            confirmed_remotely,
            repeated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CartLine, OrderStatus};
    use crate::test_support::{FakeOrderStore, RecordingNavigator, StoreCall};

    const PAY_URL: &str = "https://test-payment.momo.vn/v2/gateway/pay?t=abc";

    fn cart() -> CartSnapshot {
        CartSnapshot {
            id: "cart-1".into(),
            lines: vec![
                CartLine {
                    dish_id: "d-1".into(),
                    dish_name: "Pho".into(),
                    quantity: 1,
                    unit_price: 50_000.0,
                },
                CartLine {
                    dish_id: "d-2".into(),
                    dish_name: "Tra da".into(),
                    quantity: 2,
                    unit_price: 30_000.0,
                },
            ],
        }
    }

    fn request(kind: PaymentType) -> CheckoutRequest {
        CheckoutRequest {
            cart: cart(),
            contact: ContactInfo {
                name: "Lan".into(),
                email: "lan@example.vn".into(),
                phone: "0901234567".into(),
            },
            delivery_options: DeliveryOption::Pickup,
            type_of_payment: kind,
            table_id: None,
            delivery_address: None,
            booking_time: None,
        }
    }

    fn orchestrator(
        store: &Arc<FakeOrderStore>,
    ) -> (CheckoutOrchestrator<FakeOrderStore, RecordingNavigator>, RecordingNavigator) {
        let navigator = RecordingNavigator::default();
        let checkout =
            CheckoutOrchestrator::new(Arc::clone(store), navigator.clone(), CheckoutConfig::default());
        (checkout, navigator)
    }

    #[tokio::test]
    async fn cash_order_is_created_and_cart_cleared() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, navigator) = orchestrator(&store);

        let outcome = checkout.place_order(&request(PaymentType::Cash)).await.unwrap();

        let order = outcome.order();
        assert!(matches!(outcome, CheckoutOutcome::Placed { .. }));
        assert_eq!(order.total_price, 110_000.0);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.type_of_payment, PaymentType::Cash);
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(id) if id == "cart-1")), 1);
        assert_eq!(store.count(|c| matches!(c, StoreCall::PaymentLink(..))), 0);
        assert!(navigator.opened().is_empty());
    }

    #[tokio::test]
    async fn gateway_link_failure_keeps_cart_and_leaves_order_unpaid() {
        let store = Arc::new(FakeOrderStore::default());
        store.set_payment_link(None);
        let (checkout, navigator) = orchestrator(&store);

        let err = checkout.place_order(&request(PaymentType::Momo)).await.unwrap_err();

        let order_id = match err {
            Error::PaymentLinkUnavailable { order_id } => order_id,
            other => panic!("unexpected error: {other:?}"),
        };
        assert!(!Error::PaymentLinkUnavailable { order_id: order_id.clone() }
            .user_message()
            .is_empty());
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(_))), 0);
        let persisted = store.server_order(&order_id).unwrap();
        assert_eq!(persisted.status, OrderStatus::Pending);
        assert!(!persisted.is_paid());
        assert!(navigator.opened().is_empty());
    }

    #[tokio::test]
    async fn gateway_link_request_error_is_reported_the_same_way() {
        let store = Arc::new(FakeOrderStore::default());
        store.fail("create_payment_link", Error::service(502, "gateway down"));
        let (checkout, _navigator) = orchestrator(&store);

        let err = checkout.place_order(&request(PaymentType::Momo)).await.unwrap_err();
        assert!(matches!(err, Error::PaymentLinkUnavailable { .. }));
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(_))), 0);
    }

    #[tokio::test]
    async fn gateway_link_redirects_and_clears_cart() {
        let store = Arc::new(FakeOrderStore::default());
        store.set_payment_link(Some(PAY_URL.to_string()));
        let (checkout, navigator) = orchestrator(&store);

        let outcome = checkout.place_order(&request(PaymentType::Momo)).await.unwrap();

        let CheckoutOutcome::AwaitingPayment { order, payment_url, redirected } = outcome else {
            panic!("expected a redirect");
        };
        assert!(redirected);
        assert_eq!(payment_url, PAY_URL);
        assert_eq!(navigator.opened(), vec![PAY_URL.to_string()]);
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(_))), 1);
        assert_eq!(
            store.count(|c| matches!(c, StoreCall::PaymentLink(email, id) if email == "lan@example.vn" && *id == order.id)),
            1
        );
        assert!(!store.server_order(&order.id).unwrap().payed);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_network() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);

        let mut empty = request(PaymentType::Cash);
        empty.cart.lines.clear();
        let mut no_table = request(PaymentType::Cash);
        no_table.delivery_options = DeliveryOption::DineIn;
        let mut no_address = request(PaymentType::Cod);
        no_address.delivery_options = DeliveryOption::Delivery;
        no_address.delivery_address = Some("  ".into());
        let mut no_email = request(PaymentType::Cash);
        no_email.contact.email = String::new();
        let no_method = request(PaymentType::Unset);
        let card = request(PaymentType::Card);

        for bad in [empty, no_table, no_address, no_email, no_method, card] {
            assert!(matches!(checkout.place_order(&bad).await, Err(Error::Validation(_))));
        }
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn table_reservation_failure_does_not_undo_the_order() {
        let store = Arc::new(FakeOrderStore::default());
        store.fail("set_table_status", Error::service(500, "tables offline"));
        let (checkout, _navigator) = orchestrator(&store);
        let mut dine_in = request(PaymentType::Cash);
        dine_in.delivery_options = DeliveryOption::DineIn;
        dine_in.table_id = Some("t-4".into());

        let outcome = checkout.place_order(&dine_in).await.unwrap();

        assert_eq!(outcome.order().table.as_ref().map(|t| t.id.as_str()), Some("t-4"));
        assert_eq!(
            store.count(|c| matches!(c, StoreCall::SetTable(id, TableStatus::Reserved) if id == "t-4")),
            1
        );
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(_))), 1);
    }

    #[tokio::test]
    async fn create_failure_surfaces_and_keeps_cart() {
        let store = Arc::new(FakeOrderStore::default());
        store.fail("create_order", Error::Network("offline".into()));
        let (checkout, _navigator) = orchestrator(&store);

        let err = checkout.place_order(&request(PaymentType::Cash)).await.unwrap_err();
        assert_eq!(err, Error::Network("offline".into()));
        assert_eq!(store.count(|c| matches!(c, StoreCall::ClearCart(_))), 0);
    }

    #[tokio::test]
    async fn repeated_returns_confirm_once_and_end_paid() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);
        let order = checkout.place_order(&request(PaymentType::Cash)).await.unwrap();
        let id = order.order().id.clone();
        let redirect = format!("https://shop.vn/payment/return?orderId={id}&resultCode=0&transId=99");

        let first = checkout.handle_gateway_return(&redirect, "lan@example.vn").await.unwrap();
        let paid_once = store.server_order(&id).unwrap();
        for _ in 0..3 {
            let again = checkout.handle_gateway_return(&redirect, " LAN@example.vn ").await.unwrap();
            assert!(again.repeated);
        }

        assert_eq!(
            first,
            PaymentConfirmation {
                order_id: id.clone(),
                confirmed_remotely: true,
                repeated: false
            }
        );
        assert_eq!(store.count(|c| matches!(c, StoreCall::ConfirmPayment(..))), 1);
        assert_eq!(store.server_order(&id).unwrap(), paid_once);
        assert!(paid_once.payed);
    }

    #[tokio::test]
    async fn store_level_confirmation_is_idempotent() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);
        let id = checkout
            .place_order(&request(PaymentType::Cash))
            .await
            .unwrap()
            .order()
            .id
            .clone();

        store.confirm_payment(&id, "lan@example.vn").await.unwrap();
        let once = store.server_order(&id).unwrap();
        for _ in 0..4 {
            store.confirm_payment(&id, "lan@example.vn").await.unwrap();
        }
        assert_eq!(store.server_order(&id).unwrap(), once);
    }

    #[tokio::test]
    async fn failed_confirmation_still_reports_success_and_retries_later() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);
        let placed = checkout.place_order(&request(PaymentType::Cash)).await.unwrap();
        let id = placed.order().id.clone();
        let redirect = format!("?orderId=&extraData={id}&resultCode=0");
        store.fail("confirm_payment", Error::Network("offline".into()));

        let result = checkout.handle_gateway_return(&redirect, "").await.unwrap();
        assert_eq!(result.order_id, id);
        assert!(!result.confirmed_remotely);
        assert!(!store.server_order(&id).unwrap().payed);

        store.clear_failures();
        let retry = checkout.handle_gateway_return(&redirect, "").await.unwrap();
        assert!(retry.confirmed_remotely);
        assert!(!retry.repeated);
        assert_eq!(store.count(|c| matches!(c, StoreCall::ConfirmPayment(..))), 2);
    }

    #[tokio::test]
    async fn vnpay_success_code_confirms_payment() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);
        let id = checkout
            .place_order(&request(PaymentType::Cash))
            .await
            .unwrap()
            .order()
            .id
            .clone();

        let redirect = format!("https://shop.vn/return?orderId={id}&vnp_ResponseCode=00");
        let result = checkout.handle_gateway_return(&redirect, "lan@example.vn").await.unwrap();

        assert!(result.confirmed_remotely);
        assert!(store.server_order(&id).unwrap().payed);
    }

    #[tokio::test]
    async fn declined_or_unidentifiable_returns_do_not_confirm() {
        let store = Arc::new(FakeOrderStore::default());
        let (checkout, _navigator) = orchestrator(&store);

        let declined = checkout
            .handle_gateway_return("https://shop.vn/return?orderId=o-1&resultCode=1006", "a@b.vn")
            .await;
        assert_eq!(
            declined,
            Err(Error::GatewayDeclined {
                order_id: OrderId::from("o-1"),
                code: "1006".into()
            })
        );

        let missing = checkout
            .handle_gateway_return("https://shop.vn/return?resultCode=0", "a@b.vn")
            .await;
        assert!(matches!(missing, Err(Error::Decode(_))));
        assert_eq!(store.count(|c| matches!(c, StoreCall::ConfirmPayment(..))), 0);
    }
}
