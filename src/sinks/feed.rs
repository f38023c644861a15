//! Live feeds: server-sent events and WebSocket fan-out from a broadcast
//! channel, with the sink's history replayed first.

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::hash::Hash;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, future, stream};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Broadcast capacity per sink. Receivers further behind than this lag.
pub(crate) const BROADCAST_CAPACITY: usize = 256;

/// Fixed-size history plus a bounded memory of ids already accepted.
pub(crate) struct History<K, T> {
    items: VecDeque<T>,
    capacity: usize,
    seen: HashSet<K>,
    seen_order: VecDeque<K>,
    seen_capacity: usize,
    total: u64,
}

impl<K: Eq + Hash + Clone, T: Clone> History<K, T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            seen_capacity: capacity * 40,
            total: 0,
        }
    }

    /// Record `item` under `key`. `false` if `key` was already recorded.
    pub(crate) fn push(&mut self, key: K, item: T) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.seen_order.push_back(key);
        if self.seen_order.len() > self.seen_capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }

        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
        self.total += 1;
        true
    }

    /// Up to `limit` most recent items, oldest first.
    pub(crate) fn recent(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Items ever accepted, including ones rotated out.
    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

/// SSE response replaying `history` then following `rx`. A consumer that
/// falls behind the broadcast is disconnected.
pub(crate) fn sse_feed<T>(
    history: Vec<T>,
    rx: broadcast::Receiver<T>,
    event_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Clone + Send + 'static,
{
    let live = BroadcastStream::new(rx)
        .take_while(move |item| {
            if let Err(e) = item {
                warn!(feed = event_name, error = %e, "SSE client lagged, disconnecting");
            }
            future::ready(item.is_ok())
        })
        .filter_map(|item| future::ready(item.ok()));

    let events = stream::iter(history)
        .chain(live)
        .filter_map(move |item| future::ready(to_event(event_name, &item)))
        .map(Ok);

    debug!(feed = event_name, "SSE client connected");
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn to_event<T: Serialize>(name: &str, item: &T) -> Option<Event> {
    match Event::default().event(name).json_data(item) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(feed = name, error = %e, "Failed to encode SSE event");
            None
        }
    }
}
