//! Application-facing delivery trait and the ordered set of dispatchers.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::msg::{EntityType, Message};
use crate::net::connection::ConnectionRef;

/// Result of offering a message to a dispatcher.
#[derive(Debug)]
pub enum Delivery {
    /// The dispatcher consumed the message.
    Handled,
    /// Not for this dispatcher; offer it to the next one.
    Unhandled(Message),
}

/// Receives messages and connection lifecycle events.
///
/// Callbacks run on the messenger's dispatch task (or on the reader task for
/// fast dispatch) and must not block for long.
pub trait Dispatcher: Send + Sync {
    fn ms_dispatch(&self, m: Message) -> Delivery {
        Delivery::Unhandled(m)
    }

    /// Whether this dispatcher can fast-dispatch anything at all.
    fn ms_can_fast_dispatch_any(&self) -> bool {
        false
    }

    fn ms_can_fast_dispatch(&self, _m: &Message) -> bool {
        false
    }

    /// Deliver on the receiving task, bypassing the priority queue.
    fn ms_fast_dispatch(&self, m: Message) {
        tracing::warn!(msg_type = m.msg_type(), "fast dispatch offered but not implemented");
    }

    /// Called on the receiving task for every message before it is queued.
    fn ms_fast_preprocess(&self, _m: &Message) {}

    /// An outgoing session was established.
    fn ms_handle_connect(&self, _con: &ConnectionRef) {}

    /// An incoming session was accepted.
    fn ms_handle_accept(&self, _con: &ConnectionRef) {}

    /// The session will not resume; queued messages were dropped.
    fn ms_handle_reset(&self, _con: &ConnectionRef) -> bool {
        false
    }

    /// The peer reset the session.
    fn ms_handle_remote_reset(&self, _con: &ConnectionRef) {}

    /// The peer actively refused the connection.
    fn ms_handle_refused(&self, _con: &ConnectionRef) -> bool {
        false
    }

    /// Authorizer hook for incoming sessions. Authentication is not part of
    /// this messenger; the default accepts everyone.
    fn ms_verify_authorizer(&self, _peer_type: EntityType, _authorizer: &[u8]) -> bool {
        true
    }
}

type DispatcherList = Vec<Arc<dyn Dispatcher>>;

/// Ordered dispatcher chain shared by the dispatch and reader tasks.
///
/// Lists are swapped atomically so delivery never holds a lock while a
/// callback runs.
pub struct Dispatchers {
    all: ArcSwap<DispatcherList>,
    fast: ArcSwap<DispatcherList>,
}

impl Default for Dispatchers {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatchers {
    pub fn new() -> Self {
        Self {
            all: ArcSwap::from_pointee(Vec::new()),
            fast: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn add_head(&self, d: Arc<dyn Dispatcher>) {
        self.insert(d, true);
    }

    pub fn add_tail(&self, d: Arc<dyn Dispatcher>) {
        self.insert(d, false);
    }

    fn insert(&self, d: Arc<dyn Dispatcher>, head: bool) {
        let push = |list: &ArcSwap<DispatcherList>| {
            list.rcu(|cur| {
                let mut next: DispatcherList = (**cur).clone();
                if head {
                    next.insert(0, Arc::clone(&d));
                } else {
                    next.push(Arc::clone(&d));
                }
                next
            });
        };
        push(&self.all);
        if d.ms_can_fast_dispatch_any() {
            push(&self.fast);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all.load().is_empty()
    }

    pub fn deliver_dispatch(&self, mut m: Message) {
        for d in self.all.load().iter() {
            match d.ms_dispatch(m) {
                Delivery::Handled => return,
                Delivery::Unhandled(back) => m = back,
            }
        }
        tracing::debug!(
            msg_type = m.msg_type(),
            seq = m.seq(),
            src = %m.source(),
            "unhandled message dropped"
        );
    }

    pub fn can_fast_dispatch(&self, m: &Message) -> bool {
        self.fast.load().iter().any(|d| d.ms_can_fast_dispatch(m))
    }

    pub fn fast_dispatch(&self, m: Message) {
        let fast = self.fast.load();
        match fast.iter().find(|d| d.ms_can_fast_dispatch(&m)) {
            Some(d) => d.ms_fast_dispatch(m),
            None => tracing::error!(msg_type = m.msg_type(), "no fast dispatcher for message"),
        }
    }

    pub fn fast_preprocess(&self, m: &Message) {
        for d in self.fast.load().iter() {
            d.ms_fast_preprocess(m);
        }
    }

    pub fn deliver_connect(&self, con: &ConnectionRef) {
        for d in self.all.load().iter() {
            d.ms_handle_connect(con);
        }
    }

    pub fn deliver_accept(&self, con: &ConnectionRef) {
        for d in self.all.load().iter() {
            d.ms_handle_accept(con);
        }
    }

    pub fn deliver_reset(&self, con: &ConnectionRef) {
        for d in self.all.load().iter() {
            if d.ms_handle_reset(con) {
                return;
            }
        }
    }

    pub fn deliver_remote_reset(&self, con: &ConnectionRef) {
        for d in self.all.load().iter() {
            d.ms_handle_remote_reset(con);
        }
    }

    pub fn deliver_refused(&self, con: &ConnectionRef) {
        for d in self.all.load().iter() {
            if d.ms_handle_refused(con) {
                return;
            }
        }
    }

    /// Every dispatcher must accept the authorizer.
    pub fn verify_authorizer(&self, peer_type: EntityType, authorizer: &[u8]) -> bool {
        self.all
            .load()
            .iter()
            .all(|d| d.ms_verify_authorizer(peer_type, authorizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ByType {
        ty: u16,
        seen: AtomicUsize,
    }

    impl Dispatcher for ByType {
        fn ms_dispatch(&self, m: Message) -> Delivery {
            if m.msg_type() == self.ty {
                self.seen.fetch_add(1, Ordering::SeqCst);
                Delivery::Handled
            } else {
                Delivery::Unhandled(m)
            }
        }
    }

    #[test]
    fn chain_offers_message_until_handled() {
        let a = Arc::new(ByType {
            ty: 1,
            seen: AtomicUsize::new(0),
        });
        let b = Arc::new(ByType {
            ty: 2,
            seen: AtomicUsize::new(0),
        });
        let set = Dispatchers::new();
        set.add_tail(a.clone());
        set.add_tail(b.clone());

        set.deliver_dispatch(Message::new(2));
        set.deliver_dispatch(Message::new(1));
        set.deliver_dispatch(Message::new(3));

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fast_list_only_holds_fast_capable() {
        struct Fast;
        impl Dispatcher for Fast {
            fn ms_can_fast_dispatch_any(&self) -> bool {
                true
            }
            fn ms_can_fast_dispatch(&self, m: &Message) -> bool {
                m.msg_type() == 9
            }
            fn ms_fast_dispatch(&self, _m: Message) {}
        }
        let set = Dispatchers::new();
        set.add_tail(Arc::new(ByType {
            ty: 9,
            seen: AtomicUsize::new(0),
        }));
        assert!(!set.can_fast_dispatch(&Message::new(9)));
        set.add_head(Arc::new(Fast));
        assert!(set.can_fast_dispatch(&Message::new(9)));
        assert!(!set.can_fast_dispatch(&Message::new(8)));
    }
}
