//! Delayed delivery of received messages, for injecting network delay.
//!
//! Messages wait in FIFO order until their release time, then take the
//! same fast-dispatch-or-enqueue path the reader would have taken. A fault
//! flushes everything queued so ordering across a reconnect is kept.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::dispatch::DispatchQueue;
use crate::msg::Message;

#[derive(Default)]
struct DelayState {
    items: VecDeque<(Instant, Message)>,
    /// Number of items to release without waiting.
    flush_count: usize,
    stopped: bool,
}

enum Next {
    Deliver(Message),
    Sleep(Instant),
    Idle,
    Stop,
}

pub(crate) struct DelayedDelivery {
    state: Mutex<DelayState>,
    wake: Notify,
    dispatch: Arc<DispatchQueue>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedDelivery {
    pub(crate) fn start(dispatch: Arc<DispatchQueue>) -> Arc<Self> {
        let this = Arc::new(Self {
            state: Mutex::new(DelayState::default()),
            wake: Notify::new(),
            dispatch,
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&this).run());
        *this.task.lock().expect("delay task mutex poisoned") = Some(task);
        this
    }

    fn lock(&self) -> MutexGuard<'_, DelayState> {
        self.state.lock().expect("delay queue mutex poisoned")
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn queue(&self, release: Instant, m: Message) {
        self.lock().items.push_back((release, m));
        self.wake.notify_one();
    }

    /// Release everything currently queued immediately.
    pub(crate) fn flush(&self) {
        let mut state = self.lock();
        state.flush_count = state.items.len();
        drop(state);
        self.wake.notify_one();
    }

    /// Drop everything queued. Throttle budget is returned as the messages
    /// are dropped.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        state.flush_count = 0;
        if dropped > 0 {
            tracing::debug!(dropped, "discarded delayed messages");
        }
        dropped
    }

    pub(crate) async fn stop(&self) {
        self.lock().stopped = true;
        self.wake.notify_one();
        let task = self.task.lock().expect("delay task mutex poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn next(&self) -> Next {
        let mut state = self.lock();
        if state.stopped {
            return Next::Stop;
        }
        let release = match state.items.front() {
            None => return Next::Idle,
            Some((release, _)) => *release,
        };
        if state.flush_count > 0 || release <= Instant::now() {
            state.flush_count = state.flush_count.saturating_sub(1);
            match state.items.pop_front() {
                Some((_, m)) => Next::Deliver(m),
                None => Next::Idle,
            }
        } else {
            Next::Sleep(release)
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.next() {
                Next::Stop => break,
                Next::Idle => self.wake.notified().await,
                Next::Sleep(until) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep_until(until.into()) => {}
                    }
                }
                Next::Deliver(m) => self.deliver(m),
            }
        }
        let left = self.discard();
        tracing::trace!(left, "delayed delivery stopped");
    }

    fn deliver(&self, m: Message) {
        if self.dispatch.can_fast_dispatch(&m) {
            self.dispatch.fast_dispatch(m);
        } else {
            let class = m.connection().map(|c| c.id()).unwrap_or_default();
            let priority = m.priority();
            self.dispatch.enqueue(m, priority, class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::{Delivery, Dispatcher, Dispatchers};
    use std::time::Duration;

    #[derive(Default)]
    struct Fast {
        seen: Mutex<Vec<u16>>,
    }

    impl Dispatcher for Fast {
        fn ms_can_fast_dispatch_any(&self) -> bool {
            true
        }

        fn ms_can_fast_dispatch(&self, _m: &Message) -> bool {
            true
        }

        fn ms_fast_dispatch(&self, m: Message) {
            self.seen.lock().unwrap().push(m.msg_type());
        }

        fn ms_dispatch(&self, m: Message) -> Delivery {
            Delivery::Unhandled(m)
        }
    }

    fn setup() -> (Arc<Fast>, Arc<DelayedDelivery>) {
        let fast = Arc::new(Fast::default());
        let dispatchers = Arc::new(Dispatchers::new());
        dispatchers.add_tail(fast.clone());
        let dq = Arc::new(DispatchQueue::new(dispatchers, &DispatchConfig::default()));
        (fast, DelayedDelivery::start(dq))
    }

    #[tokio::test]
    async fn releases_in_order_after_delay() {
        let (fast, delay) = setup();
        let now = Instant::now();
        delay.queue(now + Duration::from_millis(50), Message::new(1));
        delay.queue(now, Message::new(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // the second waits behind the first
        assert!(fast.seen.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*fast.seen.lock().unwrap(), vec![1, 2]);
        delay.stop().await;
    }

    #[tokio::test]
    async fn flush_releases_immediately() {
        let (fast, delay) = setup();
        let later = Instant::now() + Duration::from_secs(60);
        delay.queue(later, Message::new(1));
        delay.queue(later, Message::new(2));
        delay.flush();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(*fast.seen.lock().unwrap(), vec![1, 2]);
        delay.stop().await;
    }

    #[tokio::test]
    async fn discard_drops_everything() {
        let (fast, delay) = setup();
        let later = Instant::now() + Duration::from_secs(60);
        delay.queue(later, Message::new(1));
        assert_eq!(delay.len(), 1);
        assert_eq!(delay.discard(), 1);
        delay.flush();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fast.seen.lock().unwrap().is_empty());
        delay.stop().await;
    }
}
