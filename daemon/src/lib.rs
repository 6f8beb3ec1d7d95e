pub mod auth;
pub mod backoff;
pub mod config;
pub mod history;
pub mod notifier;
pub mod server;
pub mod stream;

pub use auth::{AuthError, AuthSession, KeyFileSession};
pub use config::{Config, ConfigFileEndpoint, EndpointResolver, StaticEndpoint};
pub use history::{HistorySubscription, JobHistory};
pub use notifier::{Alert, AlertHandle, AlertLevel, AlertSink, JobNotifier, LogAlertSink};
pub use stream::{ConnectionState, DisconnectInfo, FeedbackClient, StreamEvent, StreamLease};
