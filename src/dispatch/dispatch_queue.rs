//! Delivery queue between socket readers and the application.
//!
//! # Responsibilities
//! - Queue received messages by priority and connection
//! - Queue lifecycle events ahead of all normal traffic
//! - Run the dispatch task and the loopback delivery task
//! - Release the dispatch throttle once a dispatcher returns
//!
//! # Design Decisions
//! - The queue lock is never held while a dispatcher runs
//! - Loopback messages go through their own FIFO so local delivery does
//!   not wait behind remote traffic
//! - After shutdown the queue drains what it has, then refuses new items

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::dispatch::dispatcher::Dispatchers;
use crate::dispatch::prioritized_queue::PrioritizedQueue;
use crate::msg::{Message, PRIO_HIGHEST};
use crate::net::connection::{ConnectionId, ConnectionRef};
use crate::observability::metrics;
use crate::throttle::Throttle;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    Connect,
    Accept,
    RemoteReset,
    Reset,
    Refused,
}

enum QueueItem {
    Message(Message),
    Event(DispatchEvent, ConnectionRef),
}

/// Priority dispatch queue with its delivery tasks.
pub struct DispatchQueue {
    queue: Mutex<PrioritizedQueue<QueueItem, ConnectionId>>,
    wake: Notify,
    local: Mutex<VecDeque<Message>>,
    local_wake: Notify,
    dispatchers: Arc<Dispatchers>,
    throttle: Arc<Throttle>,
    stopping: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchQueue {
    pub fn new(dispatchers: Arc<Dispatchers>, config: &DispatchConfig) -> Self {
        Self {
            queue: Mutex::new(PrioritizedQueue::new(
                config.max_tokens_per_priority,
                config.min_cost,
            )),
            wake: Notify::new(),
            local: Mutex::new(VecDeque::new()),
            local_wake: Notify::new(),
            dispatchers,
            throttle: Arc::new(Throttle::new("dispatch", config.throttle_bytes)),
            stopping: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PrioritizedQueue<QueueItem, ConnectionId>> {
        self.queue.lock().expect("dispatch queue mutex poisoned")
    }

    /// Spawn the dispatch and local delivery tasks.
    pub fn start(self: &Arc<Self>) {
        let dispatch = tokio::spawn(Arc::clone(self).run_dispatch());
        let local = tokio::spawn(Arc::clone(self).run_local_delivery());
        self.tasks
            .lock()
            .expect("dispatch task list mutex poisoned")
            .extend([dispatch, local]);
    }

    /// Byte budget for messages admitted but not yet dispatched.
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    pub fn dispatchers(&self) -> &Arc<Dispatchers> {
        &self.dispatchers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, m: Message, priority: u16, class: ConnectionId) {
        if self.is_stopping() {
            tracing::trace!(msg_type = m.msg_type(), "dispatch queue stopped, dropping message");
            return;
        }
        let depth = {
            let mut q = self.lock();
            if priority >= PRIO_HIGHEST {
                q.enqueue_strict(class, priority as u32, QueueItem::Message(m));
            } else {
                let cost = m.cost();
                q.enqueue(class, priority as u32, cost, QueueItem::Message(m));
            }
            q.len()
        };
        metrics::set_dispatch_queue_depth(depth);
        self.wake.notify_one();
    }

    /// Queue a self-addressed message for the loopback task.
    pub fn local_delivery(&self, mut m: Message) {
        if self.is_stopping() {
            return;
        }
        m.set_recv_stamp(std::time::Instant::now());
        self.local
            .lock()
            .expect("local delivery mutex poisoned")
            .push_back(m);
        self.local_wake.notify_one();
    }

    fn queue_event(&self, event: DispatchEvent, con: &ConnectionRef) {
        if self.is_stopping() {
            return;
        }
        tracing::debug!(connection_id = %con.id(), peer = %con.peer_addr(), ?event, "queue event");
        let item = QueueItem::Event(event, Arc::clone(con));
        self.lock().enqueue_strict(con.id(), PRIO_HIGHEST as u32, item);
        self.wake.notify_one();
    }

    pub fn queue_connect(&self, con: &ConnectionRef) {
        self.queue_event(DispatchEvent::Connect, con);
    }

    pub fn queue_accept(&self, con: &ConnectionRef) {
        self.queue_event(DispatchEvent::Accept, con);
    }

    pub fn queue_remote_reset(&self, con: &ConnectionRef) {
        self.queue_event(DispatchEvent::RemoteReset, con);
    }

    pub fn queue_reset(&self, con: &ConnectionRef) {
        self.queue_event(DispatchEvent::Reset, con);
    }

    pub fn queue_refused(&self, con: &ConnectionRef) {
        self.queue_event(DispatchEvent::Refused, con);
    }

    /// Drop everything still queued for a connection. Messages release
    /// their throttle budget as they are dropped.
    pub fn discard_queue(&self, class: ConnectionId) -> usize {
        let removed = self.lock().remove_by_class(&class);
        let n = removed
            .iter()
            .filter(|i| matches!(i, QueueItem::Message(_)))
            .count();
        if n > 0 {
            tracing::debug!(connection_id = %class, discarded = n, "discarded queued messages");
        }
        n
    }

    pub fn can_fast_dispatch(&self, m: &Message) -> bool {
        self.dispatchers.can_fast_dispatch(m)
    }

    pub fn fast_dispatch(&self, mut m: Message) {
        let permit = m.take_dispatch_permit();
        self.dispatchers.fast_dispatch(m);
        drop(permit);
    }

    pub fn fast_preprocess(&self, m: &Message) {
        self.dispatchers.fast_preprocess(m);
    }

    /// Stop accepting new items and let both tasks drain and exit.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify_one();
        self.local_wake.notify_one();
    }

    /// Join the delivery tasks.
    pub async fn wait(&self) {
        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().expect("dispatch task list mutex poisoned"),
        );
        for t in tasks {
            let _ = t.await;
        }
    }

    fn deliver(&self, item: QueueItem) {
        match item {
            QueueItem::Message(mut m) => {
                let permit = m.take_dispatch_permit();
                if let Some(stamp) = m.recv_stamp() {
                    metrics::record_dispatch_latency(stamp.elapsed());
                }
                self.dispatchers.deliver_dispatch(m);
                drop(permit);
            }
            QueueItem::Event(event, con) => match event {
                DispatchEvent::Connect => self.dispatchers.deliver_connect(&con),
                DispatchEvent::Accept => self.dispatchers.deliver_accept(&con),
                DispatchEvent::RemoteReset => self.dispatchers.deliver_remote_reset(&con),
                DispatchEvent::Reset => self.dispatchers.deliver_reset(&con),
                DispatchEvent::Refused => self.dispatchers.deliver_refused(&con),
            },
        }
    }

    async fn run_dispatch(self: Arc<Self>) {
        tracing::debug!("dispatch task started");
        loop {
            let (next, depth) = {
                let mut q = self.lock();
                let next = q.dequeue();
                (next, q.len())
            };
            match next {
                Some(item) => {
                    metrics::set_dispatch_queue_depth(depth);
                    self.deliver(item);
                }
                None if self.is_stopping() => break,
                None => self.wake.notified().await,
            }
        }
        tracing::debug!("dispatch task exited");
    }

    async fn run_local_delivery(self: Arc<Self>) {
        loop {
            let next = self
                .local
                .lock()
                .expect("local delivery mutex poisoned")
                .pop_front();
            match next {
                Some(m) => {
                    if self.can_fast_dispatch(&m) {
                        self.fast_dispatch(m);
                    } else {
                        let priority = m.priority();
                        let class = m.connection().map(|c| c.id()).unwrap_or_default();
                        self.enqueue(m, priority, class);
                    }
                }
                None if self.is_stopping() => break,
                None => self.local_wake.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatcher::{Delivery, Dispatcher};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u16>>,
    }

    impl Dispatcher for Recorder {
        fn ms_dispatch(&self, m: Message) -> Delivery {
            self.seen.lock().unwrap().push(m.msg_type());
            Delivery::Handled
        }
    }

    fn queue_with(rec: Arc<Recorder>) -> Arc<DispatchQueue> {
        let dispatchers = Arc::new(Dispatchers::new());
        dispatchers.add_tail(rec);
        Arc::new(DispatchQueue::new(dispatchers, &DispatchConfig::default()))
    }

    #[tokio::test]
    async fn dispatches_queued_messages_then_drains_on_shutdown() {
        let rec = Arc::new(Recorder::default());
        let q = queue_with(rec.clone());
        let class = ConnectionId::new();
        for t in 1..=5u16 {
            q.enqueue(Message::new(t), 127, class);
        }
        q.start();
        q.shutdown();
        tokio::time::timeout(Duration::from_secs(5), q.wait())
            .await
            .unwrap();
        assert_eq!(*rec.seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn discard_queue_drops_only_that_connection() {
        let rec = Arc::new(Recorder::default());
        let q = queue_with(rec.clone());
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        q.enqueue(Message::new(1), 127, a);
        q.enqueue(Message::new(2), 127, b);
        q.enqueue(Message::new(3), 64, a);
        assert_eq!(q.discard_queue(a), 2);
        assert_eq!(q.len(), 1);

        q.start();
        q.shutdown();
        q.wait().await;
        assert_eq!(*rec.seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn dispatch_budget_released_after_delivery() {
        let rec = Arc::new(Recorder::default());
        let q = queue_with(rec);
        let mut m = Message::new(1).with_data(vec![0u8; 100]);
        m.set_dispatch_permit(q.throttle().acquire(100).await);
        assert_eq!(q.throttle().current(), 100);
        q.enqueue(m, 127, ConnectionId::new());
        q.start();
        q.shutdown();
        q.wait().await;
        assert_eq!(q.throttle().current(), 0);
    }
}
