//! Order lifecycle and real-time synchronisation core.
//!
//! The path from "customer submits an order" through gateway confirmation,
//! broadcast to connected admin consoles, each holding an optimistically
//! mutated, self-reconciling cache of the order collection.
//!
//! Leaf-first: [`store`] talks to the order service, [`channel`] carries push
//! events, [`cache`] holds and mutates the order set, [`views`] derives
//! filtered lists and statistics, and [`checkout`] sequences order placement
//! and payment. [`console`] wires a channel and a cache for one admin session.

pub mod api;
pub mod cache;
pub mod channel;
pub mod checkout;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod models;
pub mod navigation;
pub mod store;
pub mod views;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::{Error, Result};

/// First non-empty trimmed string among `keys` on a JSON object.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Like [`value_str`], but also accepts numbers (gateways send result codes
/// as either).
pub(crate) fn value_code(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string())
            }
            _ => {}
        }
    }
    None
}

/// Lock a mutex, recovering the data if a previous holder panicked. The
/// guarded state in this crate is always left consistent between statements.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
