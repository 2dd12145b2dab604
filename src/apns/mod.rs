//! Apple Push Notification service client
//!
//! This module sends notifications through the APNs HTTP/2 provider API over
//! one certificate-authenticated connection:
//!
//! - `config` selects the environment and credentials
//! - `connection` manages the connection lifecycle and maps notifications to
//!   requests and responses to outcomes
//! - `payload` builds the `aps` JSON document
//! - `retrying` resends notifications across disconnects
//!
//! # Examples
//!
//! ```no_run
//! use apns_h2::apns::{self, ApnsConfig, Environment, NotificationPriority, RetryingProxy};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ApnsConfig::builder("apns-cert.pem", "apns-key.pem")
//!     .environment(Environment::Development)
//!     .build()?;
//!
//! let connection = apns::connect(config).await?;
//! let apns_id = connection
//!     .send_message("Hello", "a1b2c3", NotificationPriority::Immediate, Some("com.example.app"))
//!     .await?;
//! println!("accepted as {:?}", apns_id);
//!
//! let proxy = RetryingProxy::new(connection);
//! proxy
//!     .send_message("Hello again", "a1b2c3", NotificationPriority::Delayed, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod payload;
pub mod retrying;

pub use config::{ApnsConfig, ApnsConfigBuilder, ConfigError, Environment};
pub use connection::{ApnsConnection, Connector, Notification, NotificationPriority, Notifier, TlsConnector};
pub use error::{ApnsError, ConnectError, ErrorBody};
pub use payload::{Alert, Payload, PayloadAlert};
pub use retrying::RetryingProxy;

/// Production APNs host
pub const PRODUCTION_HOST: &str = "api.push.apple.com";

/// Development (sandbox) APNs host
pub const DEVELOPMENT_HOST: &str = "api.development.push.apple.com";

/// Port of both APNs hosts
pub const DEFAULT_PORT: u16 = 443;

/// Open a connection to APNs and wait until it is established
pub async fn connect(config: ApnsConfig) -> Result<ApnsConnection, ConnectError> {
    let connection = ApnsConnection::new(config);
    connection.ensure_connected().await?;
    Ok(connection)
}
