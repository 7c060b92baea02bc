//! Subscriptions: one consumer's interest in one query result.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use query_notify_listener::Notification;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

/// Callback run once when a subscription is invalidated.
pub type ChangeHandler = Box<dyn FnOnce(&Notification) + Send>;

#[derive(Default)]
struct Handlers {
   pending: Vec<ChangeHandler>,
   notification: Option<Notification>,
}

/// A consumer's registered interest in invalidation of one query result.
///
/// A subscription is invalidated exactly once, by whichever of message
/// delivery, server failure, or the timeout sweep gets there first. Later
/// attempts are no-ops.
pub struct Subscription {
   id: String,
   timeout: Duration,
   expires_at: Instant,
   servers: Mutex<HashSet<String>>,
   invalidated: AtomicBool,
   handlers: Mutex<Handlers>,
   changed_tx: watch::Sender<Option<Notification>>,
}

impl Subscription {
   /// Creates a subscription with a random id that expires `timeout` from now.
   pub fn new(timeout: Duration) -> Arc<Self> {
      Self::with_id(Uuid::new_v4().to_string(), timeout)
   }

   pub fn with_id(id: impl Into<String>, timeout: Duration) -> Arc<Self> {
      let (changed_tx, _) = watch::channel(None);
      Arc::new(Self {
         id: id.into(),
         timeout,
         expires_at: Instant::now() + timeout,
         servers: Mutex::new(HashSet::new()),
         invalidated: AtomicBool::new(false),
         handlers: Mutex::new(Handlers::default()),
         changed_tx,
      })
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn timeout(&self) -> Duration {
      self.timeout
   }

   pub fn expires_at(&self) -> Instant {
      self.expires_at
   }

   pub fn is_invalidated(&self) -> bool {
      self.invalidated.load(Ordering::Acquire)
   }

   /// The notification that invalidated this subscription, if any.
   pub fn notification(&self) -> Option<Notification> {
      self.handlers.lock().notification.clone()
   }

   /// Records that a command for this subscription ran against `server`.
   ///
   /// Returns true if the server was not already bound.
   pub fn bind_server(&self, server: &str) -> bool {
      self.servers.lock().insert(server.to_string())
   }

   pub fn is_bound_to(&self, server: &str) -> bool {
      self.servers.lock().contains(server)
   }

   pub fn servers(&self) -> Vec<String> {
      self.servers.lock().iter().cloned().collect()
   }

   /// Registers a handler. If the subscription is already invalidated the
   /// handler runs immediately on the calling thread.
   pub fn on_change<F>(&self, handler: F)
   where
      F: FnOnce(&Notification) + Send + 'static,
   {
      let notification = {
         let mut handlers = self.handlers.lock();
         match &handlers.notification {
            Some(n) => n.clone(),
            None => {
               handlers.pending.push(Box::new(handler));
               return;
            }
         }
      };
      self.run_handler(Box::new(handler), &notification);
   }

   /// Waits until the subscription is invalidated.
   ///
   /// Returns `None` only if the subscription is dropped while waiting, which
   /// cannot happen through a shared reference.
   pub async fn changed(&self) -> Option<Notification> {
      let mut rx = self.changed_tx.subscribe();
      let value = rx.wait_for(Option::is_some).await.ok()?;
      value.clone()
   }

   /// Marks the subscription invalidated and runs its handlers.
   ///
   /// Returns false if it had already been invalidated.
   pub(crate) fn invalidate(&self, notification: Notification) -> bool {
      if self.invalidated.swap(true, Ordering::AcqRel) {
         return false;
      }

      let pending = {
         let mut handlers = self.handlers.lock();
         handlers.notification = Some(notification.clone());
         std::mem::take(&mut handlers.pending)
      };

      debug!(
         subscription = %self.id,
         source = %notification.source,
         info = %notification.info,
         "Subscription invalidated"
      );

      for handler in pending {
         self.run_handler(handler, &notification);
      }
      self.changed_tx.send_replace(Some(notification));
      true
   }

   fn run_handler(&self, handler: ChangeHandler, notification: &Notification) {
      if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
         error!(subscription = %self.id, "Change handler panicked");
      }
   }
}

impl std::fmt::Debug for Subscription {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Subscription")
         .field("id", &self.id)
         .field("timeout", &self.timeout)
         .field("invalidated", &self.is_invalidated())
         .finish_non_exhaustive()
   }
}
