//! Derived View Engine.
//!
//! Pure functions over an order snapshot: filtering, sorting, pagination and
//! the dashboard aggregates. Identical input always yields identical output,
//! so views can be recomputed on every cache change.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::models::{DeliveryOption, Order, OrderStatus, PaymentType};

/// Number of dishes ranked individually before the overflow bucket.
pub const TOP_DISHES: usize = 5;
/// Label of the synthetic overflow entry.
pub const OTHER_LABEL: &str = "Other";
/// Days covered by the revenue histogram and the dish ranking.
pub const TRAILING_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Independent predicates combined with AND. An unset predicate is
/// inactive; with none active every order matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    /// Compared against the derived paid flag.
    pub paid: Option<bool>,
    pub delivery_options: Option<DeliveryOption>,
    /// `cod` also matches legacy `cash` orders.
    pub type_of_payment: Option<PaymentType>,
}

impl OrderFilter {
    pub fn is_empty(&self) -> bool {
        *self == OrderFilter::default()
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |s| order.status == s)
            && self.paid.map_or(true, |p| order.is_paid() == p)
            && self
                .delivery_options
                .map_or(true, |d| order.delivery_options == d)
            && self
                .type_of_payment
                .map_or(true, |k| order.type_of_payment.matches_filter(k))
    }

    /// Matching orders, input order preserved.
    pub fn apply(&self, orders: &[Order]) -> Vec<Order> {
        if self.is_empty() {
            return orders.to_vec();
        }
        orders.iter().filter(|o| self.matches(o)).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Sorting and pagination
// ---------------------------------------------------------------------------

/// Newest first; ties broken by id so the order is total.
pub fn sort_newest_first(orders: &mut [Order]) {
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_pages: u32,
    pub current_page: u32,
    pub total: usize,
}

/// Slice `items` into 1-based pages of `per_page`. Out-of-range pages are
/// clamped; `per_page == 0` yields everything on one page.
pub fn paginate<T: Clone>(items: &[T], page: u32, per_page: u32) -> Page<T> {
    let total = items.len();
    if per_page == 0 {
        return Page {
            items: items.to_vec(),
            total_pages: 1,
            current_page: 1,
            total,
        };
    }
    let per_page_len = per_page as usize;
    let total_pages = total.div_ceil(per_page_len).max(1) as u32;
    let current_page = page.clamp(1, total_pages);
    let start = (current_page as usize - 1) * per_page_len;
    let end = (start + per_page_len).min(total);
    Page {
        items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
        total_pages,
        current_page,
        total,
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub total_orders: usize,
    pub by_status: BTreeMap<OrderStatus, usize>,
    pub by_delivery: BTreeMap<DeliveryOption, usize>,
    pub by_payment: BTreeMap<PaymentType, usize>,
    pub paid_orders: usize,
    /// Sum of `totalPrice` over paid orders only.
    pub revenue: f64,
}

pub fn order_stats(orders: &[Order]) -> OrderStats {
    let mut by_status: BTreeMap<OrderStatus, usize> =
        OrderStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut by_delivery: BTreeMap<DeliveryOption, usize> =
        DeliveryOption::ALL.iter().map(|d| (*d, 0)).collect();
    let mut by_payment: BTreeMap<PaymentType, usize> =
        PaymentType::ALL.iter().map(|k| (*k, 0)).collect();
    let mut paid_orders = 0;
    let mut revenue = 0.0;

    for order in orders {
        *by_status.entry(order.status).or_insert(0) += 1;
        *by_delivery.entry(order.delivery_options).or_insert(0) += 1;
        *by_payment.entry(order.type_of_payment).or_insert(0) += 1;
        if order.is_paid() {
            paid_orders += 1;
            revenue += order.total_price;
        }
    }

    OrderStats {
        total_orders: orders.len(),
        by_status,
        by_delivery,
        by_payment,
        paid_orders,
        revenue,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRevenue {
    pub date: NaiveDate,
    pub revenue: f64,
    pub orders: usize,
}

/// Paid revenue for the seven local calendar days ending at `today`,
/// oldest first. Orders are bucketed by their creation time converted to
/// `tz`, never by UTC date.
pub fn daily_revenue<Tz: TimeZone>(orders: &[Order], tz: &Tz, today: NaiveDate) -> Vec<DailyRevenue> {
    let mut buckets: Vec<DailyRevenue> = (0..TRAILING_DAYS)
        .rev()
        .map(|back| DailyRevenue {
            date: today - Duration::days(back),
            revenue: 0.0,
            orders: 0,
        })
        .collect();
    let first = today - Duration::days(TRAILING_DAYS - 1);

    for order in orders.iter().filter(|o| o.is_paid()) {
        let local = order.created_at.with_timezone(tz).date_naive();
        if local < first || local > today {
            continue;
        }
        let index = (local - first).num_days() as usize;
        if let Some(bucket) = buckets.get_mut(index) {
            bucket.revenue += order.total_price;
            bucket.orders += 1;
        }
    }
    buckets
}

/// [`daily_revenue`] in the host's timezone, ending today.
pub fn daily_revenue_local(orders: &[Order]) -> Vec<DailyRevenue> {
    let today = chrono::Local::now().date_naive();
    daily_revenue(orders, &chrono::Local, today)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DishShare {
    pub name: String,
    /// `None` for the overflow bucket.
    pub dish_id: Option<String>,
    pub quantity: u64,
    pub percentage: f64,
}

/// Most ordered dishes across paid orders created in the week before
/// `now`: the top [`TOP_DISHES`] individually, the rest folded into one
/// [`OTHER_LABEL`] entry so percentages always sum to 100. No overflow entry
/// is produced when there are at most [`TOP_DISHES`] dishes.
pub fn top_dishes(orders: &[Order], now: DateTime<Utc>) -> Vec<DishShare> {
    let since = now - Duration::days(TRAILING_DAYS);
    let mut tally: HashMap<&str, (String, u64)> = HashMap::new();

    for order in orders
        .iter()
        .filter(|o| o.is_paid() && o.created_at > since && o.created_at <= now)
    {
        for line in order.lines() {
            if line.quantity == 0 {
                continue;
            }
            let entry = tally.entry(line.dish_id.as_str()).or_insert_with(|| {
                let name = if line.dish_name.trim().is_empty() {
                    line.dish_id.clone()
                } else {
                    line.dish_name.trim().to_string()
                };
                (name, 0)
            });
            entry.1 += u64::from(line.quantity);
        }
    }

    let grand_total: u64 = tally.values().map(|(_, q)| q).sum();
    if grand_total == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<(String, String, u64)> = tally
        .into_iter()
        .map(|(id, (name, qty))| (id.to_string(), name, qty))
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.1.cmp(&b.1)).then_with(|| a.0.cmp(&b.0)));

    let share = |qty: u64| qty as f64 * 100.0 / grand_total as f64;
    let overflow: u64 = ranked.iter().skip(TOP_DISHES).map(|r| r.2).sum();
    let has_overflow = ranked.len() > TOP_DISHES;

    let mut result: Vec<DishShare> = ranked
        .into_iter()
        .take(TOP_DISHES)
        .map(|(id, name, quantity)| DishShare {
            name,
            dish_id: Some(id),
            quantity,
            percentage: share(quantity),
        })
        .collect();
    if has_overflow {
        result.push(DishShare {
            name: OTHER_LABEL.to_string(),
            dish_id: None,
            quantity: overflow,
            percentage: share(overflow),
        });
    }
    result
}
