//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MessengerConfig (validated, immutable)
//!     → Messenger::new
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → Messenger::apply_config
//!         → atomic swap of the live config
//!         → throttle ceilings reset in place
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only budgets, timeouts and injection settings take effect on reload;
//!   identity and listener changes need a restart

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackoffConfig, DispatchConfig, IdentityConfig, InjectConfig, ListenerConfig, MessengerConfig,
    ObservabilityConfig, PolicyConfig, PolicyKind, TimeoutConfig, WireConfig,
};
pub use validation::{validate_config, ValidationError};
