//! Tokio runtime for the gproc operator console: the websocket transport
//! and timers behind [`gproc_sync::ConnectionManager`], the session store,
//! the REST action gateway, health polling, configuration and logging.

pub mod client;
pub mod config;
pub mod console;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod session_store;
pub mod token_store;
pub mod ws;

pub use client::{ConnectError, SyncClient};
pub use config::{load_config, Args, Config, ConfigError};
pub use console::Console;
pub use gateway::{ActionError, ActionGateway, AuthError};
pub use health::{HealthMonitor, HealthStatus};
pub use logging::{init_logging, LogGuard};
pub use session_store::{CredentialSource, SessionStatus, SessionStore};
pub use token_store::{TokenStore, TokenStoreError};
pub use ws::{LinkEvent, TokioScheduler, WsTransport};
