// =============================================================================
// SERVENT CORE - router.rs
// Shared routing capability
// =============================================================================
//
// Every participant that relays traffic (connection, network explorer,
// servent) owns or borrows:
//   1) RoutingTable - message identity -> route it arrived on
//   2) Outbox       - (message, route) pairs waiting for the sender loop
//
// Production happens inside receive loops, often under locks. The drain loop
// is the only place where the blocking write happens.
//
// Entries in a RoutingTable are never evicted while the node runs: reverse
// routes must outlive any reply still in flight. Long-running nodes pay for
// this in memory.
// =============================================================================

use crate::message::{Message, MessageId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

/// Where a message came from, or where its replies must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Originated here; replies are for this node.
    Local,
    /// An established peer connection.
    Peer(ConnectionId),
}

// -----------------------------------------------------------------------------
// RoutingTable
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RoutingTable {
    seen: Mutex<HashMap<MessageId, Route>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable { seen: Mutex::new(HashMap::new()) }
    }

    pub async fn record(&self, id: MessageId, route: Route) {
        self.seen.lock().await.insert(id, route);
    }

    /// Check-then-record in one step. Returns false if `id` was already known.
    pub async fn record_if_new(&self, id: MessageId, route: Route) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(&id) {
            return false;
        }
        seen.insert(id, route);
        true
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.seen.lock().await.contains_key(id)
    }

    pub async fn destination(&self, id: &MessageId) -> Option<Route> {
        self.seen.lock().await.get(id).copied()
    }

    pub async fn remove(&self, id: &MessageId) -> Option<Route> {
        self.seen.lock().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

// -----------------------------------------------------------------------------
// Outbox
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<(Message, Route)>>,
}

impl Outbox {
    pub fn new() -> Self {
        Outbox { queue: Mutex::new(VecDeque::new()) }
    }

    pub async fn push(&self, message: Message, route: Route) {
        self.queue.lock().await.push_back((message, route));
    }

    pub async fn pop(&self) -> Option<(Message, Route)> {
        self.queue.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn drain_all(&self) -> Vec<(Message, Route)> {
        self.queue.lock().await.drain(..).collect()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

#[async_trait]
pub trait Router: Send + Sync {
    fn routes(&self) -> &RoutingTable;

    fn outbox(&self) -> &Outbox;

    /// Actually delivers one message; called only by the drain loop.
    async fn send(&self, message: Message, route: Route);

    async fn record_seen(&self, id: MessageId, origin: Route) {
        self.routes().record(id, origin).await;
    }

    async fn has_seen(&self, id: &MessageId) -> bool {
        self.routes().contains(id).await
    }

    async fn destination_for(&self, id: &MessageId) -> Option<Route> {
        self.routes().destination(id).await
    }

    async fn forward(&self, message: Message, route: Route) {
        self.outbox().push(message, route).await;
    }
}

/// Sender loop: pops the outbox, sleeps `poll` when it is empty.
pub async fn drain<R>(router: Arc<R>, poll: Duration, stop: CancellationToken)
where
    R: Router + ?Sized,
{
    while !stop.is_cancelled() {
        match router.outbox().pop().await {
            Some((message, route)) => router.send(message, route).await,
            None => {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        routes: RoutingTable,
        outbox: Outbox,
        sent: Mutex<Vec<(MessageId, Route)>>,
    }

    #[async_trait]
    impl Router for Recorder {
        fn routes(&self) -> &RoutingTable {
            &self.routes
        }

        fn outbox(&self) -> &Outbox {
            &self.outbox
        }

        async fn send(&self, message: Message, route: Route) {
            self.sent.lock().await.push((message.id, route));
        }
    }

    #[tokio::test]
    async fn test_record_if_new_only_once() {
        let table = RoutingTable::new();
        let id = MessageId::random();
        assert!(table.record_if_new(id, Route::Peer(1)).await);
        assert!(!table.record_if_new(id, Route::Peer(2)).await);
        assert_eq!(table.destination(&id).await, Some(Route::Peer(1)));
    }

    #[tokio::test]
    async fn test_remove_forgets_route() {
        let table = RoutingTable::new();
        let id = MessageId::random();
        table.record(id, Route::Local).await;
        assert!(table.contains(&id).await);
        assert_eq!(table.remove(&id).await, Some(Route::Local));
        assert!(!table.contains(&id).await);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_drain_sends_in_order_and_stops() {
        let recorder = Arc::new(Recorder {
            routes: RoutingTable::new(),
            outbox: Outbox::new(),
            sent: Mutex::new(vec![]),
        });
        let a = Message::ping(1, 2);
        let b = Message::ping(1, 2);
        let (ida, idb) = (a.id, b.id);
        recorder.forward(a, Route::Peer(7)).await;
        recorder.forward(b, Route::Local).await;

        let stop = CancellationToken::new();
        let task = tokio::spawn(drain(Arc::clone(&recorder), Duration::from_millis(5), stop.clone()));

        for _ in 0..100 {
            if recorder.sent.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.cancel();
        task.await.unwrap();

        let sent = recorder.sent.lock().await.clone();
        assert_eq!(sent, vec![(ida, Route::Peer(7)), (idb, Route::Local)]);
        assert_eq!(recorder.outbox().len().await, 0);
    }

    #[tokio::test]
    async fn test_default_methods_use_table() {
        let recorder = Recorder {
            routes: RoutingTable::new(),
            outbox: Outbox::new(),
            sent: Mutex::new(vec![]),
        };
        let id = MessageId::random();
        assert!(!recorder.has_seen(&id).await);
        recorder.record_seen(id, Route::Peer(3)).await;
        assert!(recorder.has_seen(&id).await);
        assert_eq!(recorder.destination_for(&id).await, Some(Route::Peer(3)));
    }
}
