//! Query change notifications for database clients.
//!
//! A consumer creates a [`Subscription`], enlists it on a command through its
//! context's [`ConsumerDispatcher`], and is told once, out-of-band, when the
//! command's results change, when the server serving them fails, or when the
//! subscription expires.
//!
//! Physical listener connections are owned by the [`ProcessRegistry`] and
//! shared between every consumer context that starts a listener for the same
//! target. Subscriptions for identical queries within one context share one
//! server-side registration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use query_notify::{
//!    CommandTarget, DispatcherConfig, ProcessRegistry,
//!    listener::{ConnectionParams, ListenerConfig, MemoryBroker},
//! };
//!
//! # async fn example() -> query_notify::Result<()> {
//! let broker = MemoryBroker::new("db1", "app");
//! let registry = ProcessRegistry::new(
//!    Arc::new(broker),
//!    ListenerConfig::default(),
//!    DispatcherConfig::default(),
//! );
//!
//! let params = ConnectionParams::parse("Data Source=db1;Initial Catalog=app");
//! let dispatcher = registry.dispatcher("tenant-a")?;
//! dispatcher.start(&params, None, None).await?;
//!
//! let subscription = dispatcher.create_subscription(None)?;
//! subscription.on_change(|n| println!("changed: {:?}", n.info));
//!
//! let target = CommandTarget::new(params.clone(), "SELECT id FROM dbo.orders");
//! let request = dispatcher.enlist(&subscription, &target)?;
//! // Attach `request` to the command and execute it with your driver.
//! # let _ = request;
//!
//! dispatcher.stop(&params, None, None).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod error;
mod registry;
mod routing;
mod subscription;

pub use config::DispatcherConfig;
pub use dispatcher::ConsumerDispatcher;
pub use error::{Error, Result};
pub use registry::{ProcessRegistry, ServerInfo, StartOutcome};
pub use routing::{CommandParameter, CommandTarget, NotificationRequest, QueryFingerprint, RoutingKey};
pub use subscription::{ChangeHandler, Subscription};

pub use query_notify_listener as listener;
pub use query_notify_listener::{
   Notification, NotificationInfo, NotificationSource, NotificationType,
};
