//! Per peer type connection policies.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::{MessengerConfig, PolicyConfig, PolicyKind};
use crate::msg::wire::features;
use crate::msg::EntityType;
use crate::throttle::Throttle;

/// How sessions with one type of peer behave.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Drop the session on any fault instead of reconnecting.
    pub lossy: bool,
    /// Never initiate a reconnect; wait for the peer to come back.
    pub server: bool,
    /// Park in standby on fault when nothing is queued.
    pub standby: bool,
    /// Detect and report peer resets.
    pub resetcheck: bool,
    /// Bytes of received messages from this peer type in flight.
    pub throttler_bytes: Option<Arc<Throttle>>,
    /// Received messages from this peer type in flight.
    pub throttler_messages: Option<Arc<Throttle>>,
    pub features_supported: u64,
    pub features_required: u64,
}

impl Policy {
    fn with_flags(lossy: bool, server: bool, standby: bool, resetcheck: bool) -> Self {
        Self {
            lossy,
            server,
            standby,
            resetcheck,
            throttler_bytes: None,
            throttler_messages: None,
            features_supported: features::SUPPORTED,
            features_required: 0,
        }
    }

    pub fn stateful_server() -> Self {
        Self::with_flags(false, true, true, true)
    }

    pub fn stateless_server() -> Self {
        Self::with_flags(true, true, false, false)
    }

    pub fn lossless_peer() -> Self {
        Self::with_flags(false, false, true, false)
    }

    pub fn lossless_peer_reuse() -> Self {
        Self::with_flags(false, false, true, true)
    }

    pub fn lossy_client() -> Self {
        Self::with_flags(true, false, false, false)
    }

    pub fn lossless_client() -> Self {
        Self::with_flags(false, false, false, true)
    }

    pub fn from_kind(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Standard => Self::default(),
            PolicyKind::LossyClient => Self::lossy_client(),
            PolicyKind::LosslessPeer => Self::lossless_peer(),
            PolicyKind::LosslessPeerReuse => Self::lossless_peer_reuse(),
            PolicyKind::LosslessClient => Self::lossless_client(),
            PolicyKind::StatefulServer => Self::stateful_server(),
            PolicyKind::StatelessServer => Self::stateless_server(),
        }
    }

    pub fn with_required_features(mut self, required: u64) -> Self {
        self.features_required = required;
        self
    }

    pub fn with_throttlers(
        mut self,
        bytes: Option<Arc<Throttle>>,
        messages: Option<Arc<Throttle>>,
    ) -> Self {
        self.throttler_bytes = bytes;
        self.throttler_messages = messages;
        self
    }

    fn from_config(label: &str, config: &PolicyConfig) -> Self {
        Self::from_kind(config.kind)
            .with_required_features(config.features_required)
            .with_throttlers(
                Some(Arc::new(Throttle::new(
                    format!("{label}-bytes"),
                    config.throttle_bytes,
                ))),
                Some(Arc::new(Throttle::new(
                    format!("{label}-messages"),
                    config.throttle_messages,
                ))),
            )
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::with_flags(false, false, false, true)
    }
}

/// Policies keyed by peer type, with a fallback default.
pub struct PolicyTable {
    default: ArcSwap<Policy>,
    by_type: DashMap<EntityType, Policy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self {
            default: ArcSwap::from_pointee(Policy::default()),
            by_type: DashMap::new(),
        }
    }

    /// Build the table from validated configuration. Unknown type names
    /// were rejected by validation and are skipped here.
    pub fn from_config(config: &MessengerConfig) -> Self {
        let table = Self::new();
        table.set_default(Policy::from_config("default", &config.default_policy));
        for (name, policy) in &config.policies {
            if let Ok(ty) = name.parse::<EntityType>() {
                table.set(ty, Policy::from_config(name, policy));
            }
        }
        table
    }

    pub fn get(&self, ty: EntityType) -> Policy {
        match self.by_type.get(&ty) {
            Some(p) => p.clone(),
            None => (**self.default.load()).clone(),
        }
    }

    pub fn default_policy(&self) -> Policy {
        (**self.default.load()).clone()
    }

    pub fn set(&self, ty: EntityType, policy: Policy) {
        self.by_type.insert(ty, policy);
    }

    pub fn set_default(&self, policy: Policy) {
        self.default.store(Arc::new(policy));
    }

    /// Attach throttles to an existing policy entry, creating the entry
    /// from the default policy if needed.
    pub fn set_throttlers(
        &self,
        ty: EntityType,
        bytes: Option<Arc<Throttle>>,
        messages: Option<Arc<Throttle>>,
    ) {
        let mut entry = self
            .by_type
            .entry(ty)
            .or_insert_with(|| (**self.default.load()).clone());
        entry.throttler_bytes = bytes;
        entry.throttler_messages = messages;
    }

    /// Apply reloaded throttle ceilings in place. Policy flags are fixed
    /// for the lifetime of the messenger.
    pub fn apply_limits(&self, config: &MessengerConfig) {
        let reset = |policy: &Policy, limits: &PolicyConfig| {
            if let Some(t) = &policy.throttler_bytes {
                t.reset_max(limits.throttle_bytes);
            }
            if let Some(t) = &policy.throttler_messages {
                t.reset_max(limits.throttle_messages);
            }
        };
        reset(&self.default.load(), &config.default_policy);
        for (name, limits) in &config.policies {
            if let Ok(ty) = name.parse::<EntityType>() {
                if let Some(policy) = self.by_type.get(&ty) {
                    reset(&policy, limits);
                }
            }
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}
