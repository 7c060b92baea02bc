//! Collaborator seams.
//!
//! The listener never talks to a wire protocol directly. It opens sessions
//! through a [`Connector`] and runs SQL batches on a [`BrokerSession`].
//! Decoded notifications leave through a [`NotificationSink`].

use async_trait::async_trait;

use crate::error::SessionError;
use crate::key::{ConnectionParams, Principal};
use crate::message::Notification;
use crate::value::{Row, SqlParam};

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
   /// Opens a connection, impersonating `principal` for the duration of the
   /// open when one is given.
   async fn connect(
      &self,
      params: &ConnectionParams,
      principal: Option<&Principal>,
   ) -> SessionResult<Box<dyn BrokerSession>>;
}

/// One open physical connection.
///
/// Dropping an in-flight `query` or `execute` future must cancel the
/// server-side operation.
#[async_trait]
pub trait BrokerSession: Send {
   /// Server name as reported by the connection.
   fn server(&self) -> &str;

   /// Current database name.
   fn database(&self) -> &str;

   async fn query(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<Vec<Row>>;

   /// Runs a statement batch, returning the affected row count.
   async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<u64>;

   async fn begin_transaction(&mut self) -> SessionResult<()>;

   async fn commit(&mut self) -> SessionResult<()>;

   async fn rollback(&mut self) -> SessionResult<()>;

   async fn close(&mut self);
}

/// Receives what a listener reads off its queue.
///
/// Implementations must not block; both methods are called from the
/// listener's poll task.
pub trait NotificationSink: Send + Sync {
   /// Delivers a notification carrying a `{context};{suffix}` routing key.
   fn route(&self, routing_key: &str, notification: Notification);

   /// Invalidates every subscription bound to `server`.
   fn invalidate_server(&self, server: &str, notification: Notification);
}
