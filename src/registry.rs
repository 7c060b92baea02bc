//! The process-wide registry of listener connections and consumer dispatchers.
//!
//! Listener connections are deduplicated by [`ListenerKey`]: every
//! [`start`](ProcessRegistry::start) for an equal key shares one connection
//! and adds a reference to it. Notifications received by any listener come
//! back through [`NotificationSink`] and are routed by their routing key to
//! the dispatcher of the consumer context that registered the query.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use query_notify_listener::{
   ConnectionParams, Connector, Error as ListenerError, ListenerConfig, ListenerConnection,
   ListenerKey, Notification, NotificationSink, Principal,
};
use tokio::sync::OnceCell;
use tracing::{debug, error, trace, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::ConsumerDispatcher;
use crate::error::{Error, Result};
use crate::routing::RoutingKey;

static GLOBAL: OnceLock<Arc<ProcessRegistry>> = OnceLock::new();

/// A listener slot. Concurrent starts for one key wait on the same cell, so
/// only one of them creates the connection.
type ListenerSlot = Arc<OnceCell<Arc<ListenerConnection>>>;

/// Names resolved by a started listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
   pub server: String,
   pub database: String,
   pub queue: String,
   /// True when the listener created its own queue and service.
   pub auto_provisioned: bool,
}

impl ServerInfo {
   fn of(listener: &ListenerConnection) -> Self {
      Self {
         server: listener.server().to_string(),
         database: listener.database().to_string(),
         queue: listener.queue().to_string(),
         auto_provisioned: listener.auto_provisioned(),
      }
   }
}

/// Result of [`ProcessRegistry::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
   /// A new listener connection was created by this call.
   pub started: bool,
   /// This was the context's first reference on the listener.
   pub context_started: bool,
   /// The existing listener is failing. No reference was taken and the
   /// caller should invalidate subscriptions bound to its server.
   pub error_state: bool,
   pub server_info: ServerInfo,
}

/// Process-wide owner of listener connections and consumer dispatchers.
pub struct ProcessRegistry {
   me: Weak<Self>,
   connector: Arc<dyn Connector>,
   listener_config: ListenerConfig,
   dispatcher_config: DispatcherConfig,
   listeners: Mutex<HashMap<ListenerKey, ListenerSlot>>,
   dispatchers: Mutex<HashMap<String, Arc<ConsumerDispatcher>>>,
}

impl ProcessRegistry {
   /// Creates a standalone registry. Tests should use one per test.
   pub fn new(
      connector: Arc<dyn Connector>,
      listener_config: ListenerConfig,
      dispatcher_config: DispatcherConfig,
   ) -> Arc<Self> {
      Arc::new_cyclic(|me| Self {
         me: me.clone(),
         connector,
         listener_config,
         dispatcher_config,
         listeners: Mutex::new(HashMap::new()),
         dispatchers: Mutex::new(HashMap::new()),
      })
   }

   /// Installs the process-wide registry on first call and returns it.
   ///
   /// Later calls return the installed registry and ignore their arguments.
   pub fn init_global(
      connector: Arc<dyn Connector>,
      listener_config: ListenerConfig,
      dispatcher_config: DispatcherConfig,
   ) -> Arc<Self> {
      Arc::clone(GLOBAL.get_or_init(|| {
         debug!("Initializing process-wide notification registry");
         Self::new(connector, listener_config, dispatcher_config)
      }))
   }

   /// The process-wide registry.
   ///
   /// # Errors
   ///
   /// Returns [`Error::RegistryUnavailable`] before [`init_global`](Self::init_global).
   pub fn global() -> Result<Arc<Self>> {
      GLOBAL.get().cloned().ok_or(Error::RegistryUnavailable)
   }

   /// The dispatcher for `context_id`, created on first use.
   pub fn dispatcher(&self, context_id: &str) -> Result<Arc<ConsumerDispatcher>> {
      let mut dispatchers = self.dispatchers.lock();
      if let Some(dispatcher) = dispatchers.get(context_id) {
         return Ok(Arc::clone(dispatcher));
      }
      let dispatcher =
         ConsumerDispatcher::new(context_id, self.dispatcher_config.clone(), self.me.clone())?;
      dispatchers.insert(context_id.to_string(), Arc::clone(&dispatcher));
      Ok(dispatcher)
   }

   /// Starts a listener for the target, or joins the one already running.
   ///
   /// `queue` of `None` auto-provisions a uniquely named queue. Concurrent
   /// starts for equal keys create one connection between them.
   ///
   /// # Errors
   ///
   /// Listener setup failures are returned as [`Error::Listener`]; nothing is
   /// registered in that case.
   pub async fn start(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
      context_id: &str,
   ) -> Result<StartOutcome> {
      self.dispatcher(context_id)?;
      let key = ListenerKey::new(principal, params, queue);

      loop {
         let slot = Arc::clone(self.listeners.lock().entry(key.clone()).or_default());

         let mut created = false;
         let listener = slot
            .get_or_try_init(|| {
               created = true;
               ListenerConnection::create(
                  key.clone(),
                  Arc::clone(&self.connector),
                  self.sink(),
                  self.listener_config.clone(),
               )
            })
            .await?;
         let server_info = ServerInfo::of(listener);

         if !created && listener.in_error_state() {
            debug!(server = %server_info.server, queue = %server_info.queue, "Listener is in error state");
            return Ok(StartOutcome {
               started: false,
               context_started: false,
               error_state: true,
               server_info,
            });
         }

         match listener.increment_ref(context_id) {
            Ok(context_started) => {
               debug!(
                  queue = %server_info.queue,
                  context = %context_id,
                  created,
                  refs = listener.ref_count(),
                  "Listener started"
               );
               return Ok(StartOutcome {
                  started: created,
                  context_started,
                  error_state: false,
                  server_info,
               });
            }
            Err(ListenerError::Stopped) => {
               // Lost a race with the final stop; start over on a fresh slot.
               trace!(queue = %server_info.queue, "Listener stopping; retrying start");
               self.remove_slot(&key, &slot);
            }
            Err(e) => return Err(e.into()),
         }
      }
   }

   /// Releases one start made by `context_id`. Returns true if the listener
   /// fully stopped, in which case it is removed from the registry.
   ///
   /// # Errors
   ///
   /// Returns the failure that ended the listener's poll task. The listener
   /// has still been stopped and removed.
   pub async fn stop(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
      context_id: &str,
   ) -> Result<bool> {
      let key = ListenerKey::new(principal, params, queue);
      let Some((slot, listener)) = self.lookup(&key) else {
         debug!(context = %context_id, "Stop for a listener that is not running");
         return Ok(false);
      };

      let result = listener.stop(context_id).await;
      if listener.is_stopped() {
         self.remove_slot(&key, &slot);
      }
      Ok(result?)
   }

   /// Names resolved by the running listener for the target, if one is running.
   pub fn server_info(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
   ) -> Option<ServerInfo> {
      let key = ListenerKey::new(principal, params, queue);
      let (_, listener) = self.lookup(&key)?;
      if listener.state().is_stopping() {
         return None;
      }
      Some(ServerInfo::of(&listener))
   }

   /// Hands a notification to the dispatcher named in its routing key.
   ///
   /// Messages for unknown contexts are dropped; that happens normally after
   /// a context shuts down with registrations still on the server.
   pub fn route_message(&self, routing_key: &str, notification: Notification) {
      let Some(key) = RoutingKey::parse(routing_key) else {
         warn!(key = %routing_key, "Dropping notification with malformed routing key");
         return;
      };

      let dispatcher = self.dispatchers.lock().get(key.context_id()).cloned();
      let Some(dispatcher) = dispatcher else {
         warn!(context = %key.context_id(), "Dropping notification for unknown consumer context");
         return;
      };

      let delivered = catch_unwind(AssertUnwindSafe(|| {
         dispatcher.on_message(key.suffix(), notification)
      }));
      match delivered {
         Ok(count) => trace!(context = %key.context_id(), count, "Notification routed"),
         Err(_) => error!(context = %key.context_id(), "Panic while routing notification"),
      }
   }

   /// Invalidates subscriptions bound to `server` in every consumer context.
   ///
   /// A failure in one context does not stop the others.
   pub fn invalidate_by_server(&self, server: &str, notification: Notification) -> usize {
      let dispatchers: Vec<_> = self.dispatchers.lock().values().cloned().collect();
      let mut total = 0;
      for dispatcher in dispatchers {
         let result = catch_unwind(AssertUnwindSafe(|| {
            dispatcher.invalidate_server(server, notification.clone())
         }));
         match result {
            Ok(count) => total += count,
            Err(_) => error!(
               context = %dispatcher.context_id(),
               server = %server,
               "Panic while invalidating subscriptions"
            ),
         }
      }
      total
   }

   /// Releases every listener reference held by `context_id` and removes its
   /// dispatcher.
   ///
   /// # Errors
   ///
   /// Returns the first listener failure met while unloading. Every other
   /// listener is still released and the dispatcher is still removed.
   pub async fn on_context_shutdown(&self, context_id: &str) -> Result<()> {
      debug!(context = %context_id, "Consumer context shutting down");

      let running: Vec<_> = self
         .listeners
         .lock()
         .iter()
         .filter_map(|(key, slot)| {
            slot.get().map(|l| (key.clone(), Arc::clone(slot), Arc::clone(l)))
         })
         .collect();

      let mut failure = None;
      for (key, slot, listener) in running {
         if listener.context_ref_count(context_id) == 0 {
            continue;
         }
         let result = listener.unload_context(context_id).await;
         if listener.is_stopped() {
            self.remove_slot(&key, &slot);
         }
         if let Err(e) = result {
            warn!(
               context = %context_id,
               queue = %listener.queue(),
               error = %e,
               "Listener failed while unloading context"
            );
            if failure.is_none() {
               failure = Some(e);
            }
         }
      }

      if let Some(dispatcher) = self.dispatchers.lock().remove(context_id) {
         dispatcher.shutdown();
      }

      match failure {
         Some(e) => Err(e.into()),
         None => Ok(()),
      }
   }

   /// Number of running listener connections.
   pub fn listener_count(&self) -> usize {
      self.listeners.lock().values().filter(|slot| slot.initialized()).count()
   }

   pub fn dispatcher_count(&self) -> usize {
      self.dispatchers.lock().len()
   }

   /// The running listener for the target, if any.
   pub fn listener(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
   ) -> Option<Arc<ListenerConnection>> {
      let key = ListenerKey::new(principal, params, queue);
      self.lookup(&key).map(|(_, listener)| listener)
   }

   fn lookup(&self, key: &ListenerKey) -> Option<(ListenerSlot, Arc<ListenerConnection>)> {
      let slot = Arc::clone(self.listeners.lock().get(key)?);
      let listener = Arc::clone(slot.get()?);
      Some((slot, listener))
   }

   fn remove_slot(&self, key: &ListenerKey, slot: &ListenerSlot) {
      let mut listeners = self.listeners.lock();
      if listeners.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
         listeners.remove(key);
         trace!("Listener slot removed");
      }
   }

   fn sink(&self) -> Weak<dyn NotificationSink> {
      self.me.clone()
   }
}

impl NotificationSink for ProcessRegistry {
   fn route(&self, routing_key: &str, notification: Notification) {
      self.route_message(routing_key, notification);
   }

   fn invalidate_server(&self, server: &str, notification: Notification) {
      self.invalidate_by_server(server, notification);
   }
}

impl std::fmt::Debug for ProcessRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ProcessRegistry")
         .field("listeners", &self.listener_count())
         .field("dispatchers", &self.dispatcher_count())
         .finish_non_exhaustive()
   }
}
