//! Listener connections for database query change notifications.
//!
//! A [`ListenerConnection`] holds one dedicated session that waits on a
//! server-side notification queue. Each message it receives is decoded by
//! [`parse_message`] and handed to a [`NotificationSink`], which routes it to
//! the subscriber that registered the query.
//!
//! The crate does not ship a database driver. Connections are opened through
//! the [`Connector`] and [`BrokerSession`] traits; [`MemoryBroker`] implements
//! both in-process for tests and local development.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::{Arc, Weak};
//! use query_notify_listener::{
//!    ConnectionParams, ListenerConfig, ListenerConnection, ListenerKey, MemoryBroker,
//!    Notification, NotificationSink,
//! };
//!
//! struct Printer;
//!
//! impl NotificationSink for Printer {
//!    fn route(&self, key: &str, n: Notification) {
//!       println!("{key}: {:?}", n.info);
//!    }
//!    fn invalidate_server(&self, server: &str, _n: Notification) {
//!       println!("{server} lost");
//!    }
//! }
//!
//! # async fn example() -> query_notify_listener::Result<()> {
//! let broker = MemoryBroker::new("db1", "app");
//! let sink: Arc<dyn NotificationSink> = Arc::new(Printer);
//! let params = ConnectionParams::parse("Data Source=db1;Initial Catalog=app");
//! let key = ListenerKey::new(None, &params, None);
//!
//! let listener = ListenerConnection::create(
//!    key,
//!    Arc::new(broker),
//!    Arc::downgrade(&sink),
//!    ListenerConfig::default(),
//! )
//! .await?;
//! listener.increment_ref("ctx")?;
//! // ...
//! listener.stop("ctx").await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod error;
mod key;
mod listener;
mod memory;
mod message;
mod session;
mod value;

pub use command::ReceiveCommand;
pub use config::ListenerConfig;
pub use error::{Error, SessionError, SessionErrorKind};
pub use key::{ConnectionParams, ListenerKey, Principal, escape_identifier, string_literal};
pub use listener::{ListenerConnection, ListenerState};
pub use memory::{MemoryBroker, QueuedMessage};
pub use message::{
   Notification, NotificationInfo, NotificationSource, NotificationType,
   QUERY_NOTIFICATION_MESSAGE_TYPE, parse_message, render_message,
};
pub use session::{BrokerSession, Connector, NotificationSink, SessionResult};
pub use value::{Row, SqlParam, SqlValue};

/// A type alias for Results with listener errors
pub type Result<T> = std::result::Result<T, Error>;
