//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use simple_messenger::config::MessengerConfig;
use simple_messenger::{
    ConnectionRef, Delivery, Dispatcher, EntityName, EntityType, Message, Messenger, Policy,
};

/// One message as seen by a [`Recorder`].
pub struct Received {
    pub msg_type: u16,
    pub tid: u64,
    pub data: Bytes,
    pub connection: Option<ConnectionRef>,
}

/// Dispatcher that keeps everything it is given.
#[derive(Default)]
pub struct Recorder {
    pub messages: Mutex<Vec<Received>>,
    pub connects: AtomicUsize,
    pub accepts: AtomicUsize,
    pub resets: AtomicUsize,
    pub remote_resets: AtomicUsize,
    pub refused: AtomicUsize,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn tids(&self) -> Vec<u64> {
        self.messages.lock().unwrap().iter().map(|m| m.tid).collect()
    }

    pub fn last_connection(&self) -> Option<ConnectionRef> {
        self.messages
            .lock()
            .unwrap()
            .last()
            .and_then(|m| m.connection.clone())
    }
}

impl Dispatcher for Recorder {
    fn ms_dispatch(&self, m: Message) -> Delivery {
        self.messages.lock().unwrap().push(Received {
            msg_type: m.msg_type(),
            tid: m.tid(),
            data: m.data().clone(),
            connection: m.connection().cloned(),
        });
        Delivery::Handled
    }

    fn ms_handle_connect(&self, _con: &ConnectionRef) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn ms_handle_accept(&self, _con: &ConnectionRef) {
        self.accepts.fetch_add(1, Ordering::SeqCst);
    }

    fn ms_handle_reset(&self, _con: &ConnectionRef) -> bool {
        self.resets.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn ms_handle_remote_reset(&self, _con: &ConnectionRef) {
        self.remote_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn ms_handle_refused(&self, _con: &ConnectionRef) -> bool {
        self.refused.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Defaults with short timeouts so failure paths finish quickly.
pub fn test_config() -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.timeouts.connect_ms = 1_000;
    config.timeouts.handshake_ms = 2_000;
    config.timeouts.wait_ms = 1_000;
    config.backoff.initial_ms = 5;
    config.backoff.max_ms = 50;
    config
}

/// Bind on an ephemeral loopback port and start, with `policies` applied
/// first.
pub async fn start_messenger(
    name: EntityName,
    config: MessengerConfig,
    policies: &[(EntityType, Policy)],
) -> (Messenger, Arc<Recorder>) {
    let msgr = Messenger::new(name, config);
    let rec = Arc::new(Recorder::default());
    msgr.add_dispatcher_tail(rec.clone());
    for (ty, policy) in policies {
        msgr.set_policy(*ty, policy.clone());
    }
    msgr.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    msgr.start().unwrap();
    (msgr, rec)
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Shut a messenger down and fail the test if it does not finish.
pub async fn stop(msgr: Messenger) {
    msgr.shutdown();
    with_timeout(Duration::from_secs(10), msgr.wait()).await;
}

pub async fn with_timeout<F: Future>(timeout: Duration, fut: F) -> F::Output {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("timed out")
}

pub fn numbered(msg_type: u16, tid: u64) -> Message {
    Message::new(msg_type)
        .with_tid(tid)
        .with_data(Bytes::from(format!("payload-{tid}")))
}
