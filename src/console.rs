//! Admin console session.
//!
//! Wires one shared [`ChannelManager`] to one [`OrderCache`]: on open it
//! connects, joins the admin room, subscribes to the order events and loads
//! the order list; on close (or drop) it unsubscribes and releases its room
//! reference. Other consoles on the same channel are unaffected.

use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::{MutationOutcome, OrderCache, OrderSnapshot, QueryKey};
use crate::channel::{ChannelManager, PushTransport, SubscriptionId, TransportState};
use crate::error::Result;
use crate::lock;
use crate::models::{EventKind, Order, OrderId, OrderStatus, PaymentType};
use crate::store::{ListQuery, OrderStore};
use crate::views::{self, OrderFilter, OrderStats, Page};

pub struct AdminConsole<T: PushTransport, S: OrderStore> {
    channel: ChannelManager<T>,
    cache: OrderCache<S>,
    room: String,
    query: QueryKey,
    /// `Some` while open.
    subscriptions: Mutex<Option<Vec<SubscriptionId>>>,
}

impl<T: PushTransport, S: OrderStore> AdminConsole<T, S> {
    pub fn new(channel: ChannelManager<T>, cache: OrderCache<S>) -> Self {
        let room = channel.config().admin_room.clone();
        Self {
            channel,
            cache,
            room,
            query: ListQuery::all(),
            subscriptions: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &OrderCache<S> {
        &self.cache
    }

    pub fn channel(&self) -> &ChannelManager<T> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        lock(&self.subscriptions).is_some()
    }

    /// Start the session and load the order list.
    ///
    /// A channel that cannot connect is not an error: the console still
    /// works from refetches. A failed initial load is.
    pub async fn open(&self) -> Result<OrderSnapshot> {
        let already_open = {
            let mut subscriptions = lock(&self.subscriptions);
            let open = subscriptions.is_some();
            if !open {
                *subscriptions = Some(Vec::new());
            }
            open
        };
        if already_open {
            debug!("Admin console already open");
            return self.cache.get_or_fetch(&self.query).await;
        }

        let state = self.channel.connect().await;
        if state == TransportState::Disconnected {
            info!("Push channel unavailable; console relies on manual refresh");
        }
        self.channel.join_room(&self.room);

        let mut ids = Vec::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            let cache = self.cache.clone();
            let alert = self.channel.alert();
            ids.push(self.channel.subscribe(kind, move |envelope| {
                cache.ingest(envelope);
                if matches!(envelope.kind, EventKind::OrderNew | EventKind::PaymentSuccess) {
                    alert.play(None);
                }
            }));
        }
        if let Some(held) = lock(&self.subscriptions).as_mut() {
            held.extend(ids);
        }
        info!(room = %self.room, "Admin console opened");

        self.cache.fetch(&self.query).await
    }

    /// End the session. Idempotent.
    pub fn close(&self) {
        let Some(ids) = lock(&self.subscriptions).take() else {
            return;
        };
        for id in ids {
            self.channel.unsubscribe(id);
        }
        self.channel.leave_room(&self.room);
        self.channel.stop_alert();
        info!(room = %self.room, "Admin console closed");
    }

    /// Force a refetch of the order list.
    pub async fn refresh(&self) -> Result<OrderSnapshot> {
        self.cache.invalidate(&self.query);
        self.cache.fetch(&self.query).await
    }

    pub fn orders(&self) -> OrderSnapshot {
        self.cache.snapshot(&self.query).unwrap_or_default()
    }

    pub fn changes(&self) -> watch::Receiver<OrderSnapshot> {
        self.cache.subscribe(&self.query)
    }

    /// Filtered, newest-first page of the current snapshot.
    pub fn view(&self, filter: &OrderFilter, page: u32, per_page: u32) -> Page<Order> {
        let mut rows = filter.apply(&self.orders());
        views::sort_newest_first(&mut rows);
        views::paginate(&rows, page, per_page)
    }

    pub fn stats(&self) -> OrderStats {
        views::order_stats(&self.orders())
    }

    pub async fn set_status(&self, id: &OrderId, status: OrderStatus) -> Result<MutationOutcome> {
        self.cache.mutate_status(id, status).await
    }

    pub async fn set_payment_method(&self, id: &OrderId, kind: PaymentType) -> Result<MutationOutcome> {
        self.cache.mutate_payment_method(id, kind).await
    }

    pub async fn delete_order(&self, id: &OrderId) -> Result<()> {
        self.cache.delete(id).await
    }
}

impl<T: PushTransport, S: OrderStore> Drop for AdminConsole<T, S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RoomCommand;
    use crate::config::{CacheConfig, ChannelConfig};
    use crate::test_support::{order, settle, FakeOrderStore, FakeTransport, RecordingAlertPlayer};
    use std::sync::Arc;

    fn console(
        channel: &ChannelManager<FakeTransport>,
        store: &Arc<FakeOrderStore>,
    ) -> AdminConsole<FakeTransport, FakeOrderStore> {
        AdminConsole::new(
            channel.clone(),
            OrderCache::new(Arc::clone(store), &CacheConfig::default()),
        )
    }

    fn ids(rows: &[Order]) -> Vec<&str> {
        rows.iter().map(|o| o.id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn open_joins_room_and_applies_pushes() {
        let transport = FakeTransport::healthy();
        let player = Arc::new(RecordingAlertPlayer::default());
        let channel =
            ChannelManager::with_alert_player(transport.clone(), ChannelConfig::default(), player.clone());
        let store = Arc::new(FakeOrderStore::with_orders(vec![order("o-1").build()]));
        let admin = console(&channel, &store);

        let loaded = admin.open().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(transport.commands(0), vec![RoomCommand::Join("admin".into())]);
        assert_eq!(channel.listener_count(EventKind::OrderNew), 1);

        let fresh = order("o-2").build();
        transport
            .emit("order:new", serde_json::to_value(&fresh).unwrap())
            .await;
        settle().await;

        assert_eq!(ids(&admin.orders()), vec!["o-2", "o-1"]);
        assert!(channel.is_alert_playing());
        assert_eq!(player.counts().0, 1);

        transport
            .emit("order:statusUpdate", serde_json::json!({ "orderId": "o-1", "status": "confirmed" }))
            .await;
        settle().await;
        let confirmed = admin.view(
            &OrderFilter {
                status: Some(OrderStatus::Confirmed),
                ..Default::default()
            },
            1,
            10,
        );
        assert_eq!(ids(&confirmed.items), vec!["o-1"]);
        assert_eq!(admin.stats().paid_orders, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_one_console_leaves_the_other_subscribed() {
        let transport = FakeTransport::healthy();
        let channel = ChannelManager::new(transport.clone(), ChannelConfig::default());
        let store = Arc::new(FakeOrderStore::with_orders(vec![order("o-1").build()]));
        let first = console(&channel, &store);
        let second = console(&channel, &store);

        first.open().await.unwrap();
        second.open().await.unwrap();
        assert_eq!(transport.opens(), 1);
        assert_eq!(channel.room_refs("admin"), 2);
        assert_eq!(transport.commands(0), vec![RoomCommand::Join("admin".into())]);

        first.close();
        first.close();
        assert!(!first.is_open());
        assert_eq!(channel.room_refs("admin"), 1);
        assert!(transport.commands(0).is_empty());
        assert_eq!(channel.listener_count(EventKind::OrderStatusUpdate), 1);

        transport
            .emit("order:statusUpdate", serde_json::json!({ "orderId": "o-1", "status": "cancelled" }))
            .await;
        settle().await;
        assert_eq!(second.orders()[0].status, OrderStatus::Cancelled);
        assert_eq!(first.orders()[0].status, OrderStatus::Pending);

        drop(second);
        assert_eq!(channel.room_refs("admin"), 0);
        assert_eq!(transport.commands(0), vec![RoomCommand::Leave("admin".into())]);
        assert_eq!(channel.listener_count(EventKind::OrderStatusUpdate), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn console_works_without_a_channel() {
        let transport = FakeTransport::failing();
        let channel = ChannelManager::new(
            transport.clone(),
            ChannelConfig {
                max_reconnect_attempts: 1,
                ..Default::default()
            },
        );
        let store = Arc::new(FakeOrderStore::with_orders(vec![order("o-1").build()]));
        let admin = console(&channel, &store);

        assert_eq!(admin.open().await.unwrap().len(), 1);
        assert_eq!(channel.state(), TransportState::Disconnected);

        let outcome = admin
            .set_status(&OrderId::from("o-1"), OrderStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert_eq!(admin.orders()[0].status, OrderStatus::Confirmed);
    }
}
