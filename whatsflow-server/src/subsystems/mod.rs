pub mod commands;
pub mod ingest;
pub mod registry;
pub mod supervisor;
pub mod webhooks;

pub use commands::CommandRouter;
pub use ingest::StatusIngestor;
pub use registry::{SessionRegistry, StatusUpdate};
pub use supervisor::{run_exit_monitor, ConnectorSupervisor, ProcessExit, ProcessInfo};
pub use webhooks::{CreateWebhook, WebhookConfigService};
