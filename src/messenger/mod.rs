//! Messenger subsystem: the application-facing entry point.
//!
//! # Data Flow
//! ```text
//! send_message(m, dest)
//!     → core.rs (existing session? loopback? new connecting socket)
//!     → socket outbound queue → writer
//!
//! received message
//!     → reader → dispatch queue → Dispatcher::ms_dispatch
//! ```
//!
//! # Design Decisions
//! - `Messenger` is a thin handle over `MessengerCore`; connections and
//!   sockets hold the core, never the handle
//! - Policies are looked up per peer type when a session is created
//! - Configuration reloads only change limits, never policy flags

pub(crate) mod core;
pub mod policy;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::MessengerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{MessengerError, MessengerResult};
use crate::msg::{EntityAddr, EntityInst, EntityName, EntityType, Message};
use crate::net::connection::ConnectionRef;
use crate::throttle::Throttle;

pub use self::core::MessengerStatus;
pub use policy::{Policy, PolicyTable};

use self::core::MessengerCore;

/// A messaging endpoint: one identity, one listen address, and any number
/// of sessions with peers.
///
/// # Example
/// ```no_run
/// use simple_messenger::{EntityName, Messenger, MessengerConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let msgr = Messenger::new(EntityName::osd(0), MessengerConfig::default());
/// msgr.bind("127.0.0.1:0".parse()?).await?;
/// msgr.start()?;
/// // ...
/// msgr.shutdown();
/// msgr.wait().await;
/// # Ok(())
/// # }
/// ```
pub struct Messenger {
    core: Arc<MessengerCore>,
}

impl Messenger {
    pub fn new(name: EntityName, config: MessengerConfig) -> Self {
        Self {
            core: MessengerCore::new(name, config),
        }
    }

    /// Build a messenger named by `identity.name` in `config`.
    pub fn from_config(config: MessengerConfig) -> MessengerResult<Self> {
        let name: EntityName = config
            .identity
            .name
            .parse()
            .map_err(|_| MessengerError::InvalidName(config.identity.name.clone()))?;
        Ok(Self::new(name, config))
    }

    pub fn add_dispatcher_head(&self, d: Arc<dyn Dispatcher>) {
        self.core.dispatch().dispatchers().add_head(d);
    }

    pub fn add_dispatcher_tail(&self, d: Arc<dyn Dispatcher>) {
        self.core.dispatch().dispatchers().add_tail(d);
    }

    /// Policy for sessions with peers of type `ty`. Takes effect for
    /// sessions created afterwards.
    pub fn set_policy(&self, ty: EntityType, policy: Policy) {
        self.core.policies().set(ty, policy);
    }

    pub fn set_default_policy(&self, policy: Policy) {
        self.core.policies().set_default(policy);
    }

    pub fn set_policy_throttlers(
        &self,
        ty: EntityType,
        bytes: Option<Arc<Throttle>>,
        messages: Option<Arc<Throttle>>,
    ) {
        self.core.policies().set_throttlers(ty, bytes, messages);
    }

    pub fn get_policy(&self, ty: EntityType) -> Policy {
        self.core.policies().get(ty)
    }

    /// Bind the listen address. Port 0 picks a free port; the returned
    /// address is the one peers should use.
    pub async fn bind(&self, addr: SocketAddr) -> MessengerResult<EntityAddr> {
        self.core.bind(addr).await
    }

    /// Start the dispatch, reaper and accept tasks.
    pub fn start(&self) -> MessengerResult<()> {
        self.core.start()
    }

    pub fn my_name(&self) -> EntityName {
        self.core.my_name()
    }

    pub fn set_my_name(&self, name: EntityName) {
        self.core.set_my_name(name);
    }

    pub fn my_addr(&self) -> EntityAddr {
        self.core.my_addr()
    }

    pub fn my_inst(&self) -> EntityInst {
        EntityInst::new(self.my_name(), self.my_addr())
    }

    /// Queue `m` for `dest`, connecting if there is no session yet.
    pub fn send_message(&self, m: Message, dest: &EntityInst) -> MessengerResult<()> {
        self.core.send_message(m, dest)
    }

    /// Handle on the session with `dest`, creating one if needed.
    pub fn get_connection(&self, dest: &EntityInst) -> MessengerResult<ConnectionRef> {
        self.core.get_connection(dest)
    }

    /// Connection that delivers to this messenger's own dispatchers.
    pub fn get_loopback_connection(&self) -> ConnectionRef {
        Arc::clone(self.core.loopback())
    }

    /// Close the session with `addr`. Dispatchers see a reset.
    pub fn mark_down(&self, addr: &EntityAddr) {
        self.core.mark_down(addr);
    }

    /// Close every session and every handshake in progress.
    pub fn mark_down_all(&self) {
        self.core.mark_down_all();
    }

    /// Apply reloaded configuration. Throttle ceilings and timeouts change
    /// in place; identity, listener and policy flags do not.
    pub fn apply_config(&self, config: MessengerConfig) {
        self.core.apply_config(config);
    }

    pub fn config(&self) -> Arc<MessengerConfig> {
        self.core.config()
    }

    pub fn status(&self) -> MessengerStatus {
        self.core.status()
    }

    /// Begin shutdown. Returns immediately; use [`Messenger::wait`] to
    /// wait for completion.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Wait for shutdown to complete.
    pub async fn wait(&self) {
        self.core.wait().await;
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.my_name())
            .field("addr", &self.my_addr())
            .finish()
    }
}
