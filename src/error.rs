//! Error taxonomy for the order lifecycle core.
//!
//! Every fallible operation in the crate returns [`Result`]. Variants map to
//! the recovery classes the console cares about: validation failures never
//! touch the network, service and network failures are surfaced to the user
//! (and roll back optimistic mutations), and channel failures are logged only.

use thiserror::Error;

use crate::models::{OrderId, OrderStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{message} (HTTP {status})")]
    Service { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response shape: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("A change for order {0} is already in flight")]
    MutationInFlight(OrderId),

    #[error("Payment link unavailable for order {order_id}")]
    PaymentLinkUnavailable { order_id: OrderId },

    #[error("Payment for order {order_id} was declined by the gateway (code {code})")]
    GatewayDeclined { order_id: OrderId, code: String },

    #[error("Notification channel error: {0}")]
    Channel(String),

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    pub fn service(status: u16, message: impl Into<String>) -> Self {
        Error::Service {
            status,
            message: message.into(),
        }
    }

    /// HTTP-like status code for the failure.
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::InvalidTransition { .. } => 400,
            Error::Service { status, .. } => *status,
            Error::NotFound(_) => 404,
            Error::MutationInFlight(_) => 409,
            Error::GatewayDeclined { .. } => 402,
            Error::Network(_) | Error::Decode(_) | Error::PaymentLinkUnavailable { .. } => 502,
            Error::Channel(_) => 503,
            Error::Navigation(_) | Error::Config(_) => 500,
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Channel(_) => true,
            Error::Service { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Text suitable for a toast or banner in the console.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::Service { message, .. } if !message.trim().is_empty() => message.clone(),
            Error::Service { status, .. } => format!("Order service error (HTTP {status})"),
            Error::Network(msg) => msg.clone(),
            Error::PaymentLinkUnavailable { .. } => {
                "Could not start the online payment. Please try again or pick another method."
                    .to_string()
            }
            Error::GatewayDeclined { .. } => "The payment was not completed.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
