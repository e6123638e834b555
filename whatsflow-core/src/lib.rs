pub mod address;
pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use address::{AddressAllocator, ConnectorAddress, DEFAULT_BASE_PORT};
pub use config::WhatsflowConfig;
pub use connector::{CommandKind, ConnectorCommand, ConnectorReply};
pub use error::{Result, WhatsflowError};
pub use models::{Session, SessionId, SessionStatus, Webhook, WebhookId};
pub use store::{MemoryStore, PgSessionStore, SessionStore};
