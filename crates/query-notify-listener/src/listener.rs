//! Dedicated connections that poll a notification queue.
//!
//! A [`ListenerConnection`] owns one physical session and keeps a single
//! receive in flight against its queue. Failures while polling put it into
//! recovery, which reconnects and re-provisions at a fixed interval until it
//! succeeds or the last reference is stopped.
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──► Listening ◄──► Recovering
//!                      │               │
//!                      └──► Stopping ◄─┘
//!                              │
//!                              ▼
//!                           Stopped
//! ```
//!
//! The transition to `Stopping` happens when the global reference count
//! reaches zero. Either the poll task or the stopping caller then performs
//! teardown; the server-side cleanup inside it runs at most once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::command::{END_CONVERSATION_SQL, ReceiveCommand};
use crate::config::ListenerConfig;
use crate::error::{Error, SessionError};
use crate::key::{ConnectionParams, ListenerKey, escape_identifier, string_literal};
use crate::message::{Notification, QUERY_NOTIFICATION_MESSAGE_TYPE, parse_message};
use crate::session::{BrokerSession, Connector, NotificationSink};
use crate::value::{Row, SqlValue};
use crate::Result;

const BROKER_ENABLED_SQL: &str =
   "select is_broker_enabled from sys.databases where database_id=db_id()";
const POST_QUERY_NOTIFICATION_CONTRACT: &str =
   "http://schemas.microsoft.com/SQL/Notifications/PostQueryNotification";
const DIALOG_TIMER_MESSAGE_TYPE: &str =
   "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer";

/// Lifecycle of a listener connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
   Initializing,
   Listening,
   Recovering,
   Stopping,
   Stopped,
}

impl ListenerState {
   pub fn is_stopping(self) -> bool {
      matches!(self, ListenerState::Stopping | ListenerState::Stopped)
   }
}

#[derive(Debug, Default)]
struct RefCounts {
   global: usize,
   per_context: HashMap<String, usize>,
}

/// Session and the command that runs on it. Only one operation uses it at a time.
struct Channel {
   session: Option<Box<dyn BrokerSession>>,
   command: ReceiveCommand,
}

/// A routed notification waiting to be handed to the sink.
type Delivery = (String, Notification);

pub struct ListenerConnection {
   key: ListenerKey,
   connect_params: ConnectionParams,
   queue: String,
   procedure: Option<String>,
   server: String,
   database: String,
   config: ListenerConfig,
   connector: Arc<dyn Connector>,
   sink: Weak<dyn NotificationSink>,
   channel: AsyncMutex<Channel>,
   refs: Mutex<RefCounts>,
   state_tx: watch::Sender<ListenerState>,
   poll_task: Mutex<Option<JoinHandle<Result<()>>>>,
   objects_created: AtomicBool,
   error_state: AtomicBool,
   episode_invalidated: AtomicBool,
   cleanup_done: AtomicBool,
}

impl ListenerConnection {
   /// Opens and verifies a listener for `key`.
   ///
   /// When the key carries no queue name, a uniquely named queue, service,
   /// and activation procedure are created first. A zero-timeout receive is
   /// then issued so that misconfiguration fails here rather than in the
   /// background. On success the steady-state poll task is running.
   ///
   /// # Errors
   ///
   /// Returns [`Error::SetupFailed`] (or the fatal error itself) after
   /// dropping anything this call created and closing the session.
   pub async fn create(
      key: ListenerKey,
      connector: Arc<dyn Connector>,
      sink: Weak<dyn NotificationSink>,
      config: ListenerConfig,
   ) -> Result<Arc<Self>> {
      let (queue, procedure) = match key.queue() {
         Some(queue) => (queue.to_string(), None),
         None => {
            let id = Uuid::new_v4();
            (
               format!("{}-{}", config.service_name_prefix, id),
               Some(format!("{}-{}", config.procedure_name_prefix, id)),
            )
         }
      };

      // The activation procedure identifies its own connection by application name.
      let connect_params = key.params().for_listener(Some(&queue));

      debug!(queue = %queue, auto_provision = procedure.is_some(), "Creating listener connection");

      let session = connector
         .connect(&connect_params, key.principal())
         .await
         .map_err(|e| Error::setup_failed(&queue, e.into()))?;

      let listener = Arc::new(Self {
         server: session.server().to_string(),
         database: session.database().to_string(),
         channel: AsyncMutex::new(Channel {
            session: Some(session),
            command: ReceiveCommand::new(&queue),
         }),
         key,
         connect_params,
         queue,
         procedure,
         config,
         connector,
         sink,
         refs: Mutex::new(RefCounts::default()),
         state_tx: watch::Sender::new(ListenerState::Initializing),
         poll_task: Mutex::new(None),
         objects_created: AtomicBool::new(false),
         error_state: AtomicBool::new(false),
         episode_invalidated: AtomicBool::new(false),
         cleanup_done: AtomicBool::new(false),
      });

      let deliveries = match listener.setup().await {
         Ok(deliveries) => deliveries,
         Err(e) => {
            warn!(queue = %listener.queue, error = %e, "Listener setup failed; unwinding");
            listener.teardown().await;
            return Err(Error::setup_failed(&listener.queue, e));
         }
      };

      listener.state_tx.send_replace(ListenerState::Listening);
      let task = tokio::spawn(Arc::clone(&listener).poll_loop());
      *listener.poll_task.lock() = Some(task);

      info!(
         queue = %listener.queue,
         server = %listener.server,
         database = %listener.database,
         "Listener connection started"
      );

      listener.deliver(deliveries);
      Ok(listener)
   }

   async fn setup(&self) -> Result<Vec<Delivery>> {
      let mut guard = self.channel.lock().await;
      let channel = &mut *guard;

      let session = Self::session_mut(&mut channel.session)?;
      let rows = session.query(BROKER_ENABLED_SQL, &[]).await?;
      let enabled = rows
         .first()
         .and_then(|row| row.get(0))
         .and_then(SqlValue::as_bool)
         .unwrap_or(false);
      if !enabled {
         return Err(Error::BrokerDisabled {
            database: self.database.clone(),
         });
      }

      if self.procedure.is_some() {
         self.provision(channel, false).await?;
      }

      channel.command.set_timeout(Duration::ZERO);
      let deliveries = self.receive(channel).await?;
      channel.command.set_timeout(self.config.wait_timeout());
      Ok(deliveries)
   }

   /// Creates the queue, service, and activation procedure in one transaction
   /// and begins the dialog whose timer drives self-cleanup.
   ///
   /// On restart a failure to create the procedure is expected (it usually
   /// still exists) and is rolled back before continuing.
   async fn provision(&self, channel: &mut Channel, restart: bool) -> Result<()> {
      let Some(procedure) = self.procedure.as_deref() else {
         return Ok(());
      };
      let escaped_queue = escape_identifier(&self.queue);
      let escaped_procedure = escape_identifier(procedure);
      let name_literal = string_literal(&self.queue);

      let create_procedure = format!(
         "CREATE PROCEDURE {proc} AS BEGIN BEGIN TRANSACTION; \
          RECEIVE TOP(0) conversation_handle FROM {queue}; \
          IF (SELECT COUNT(*) FROM {queue} WHERE message_type_name = '{timer}') > 0 BEGIN \
          if ((SELECT COUNT(*) FROM sys.services WHERE name = {name}) > 0) DROP SERVICE {queue}; \
          if (OBJECT_ID({name}, 'SQ') IS NOT NULL) DROP QUEUE {queue}; \
          DROP PROCEDURE {proc}; END COMMIT TRANSACTION; END",
         proc = escaped_procedure,
         queue = escaped_queue,
         name = name_literal,
         timer = DIALOG_TIMER_MESSAGE_TYPE,
      );
      let create_queue_and_service = format!(
         "DECLARE @dialog_handle UNIQUEIDENTIFIER; \
          IF OBJECT_ID({name}, 'SQ') IS NULL BEGIN \
          CREATE QUEUE {queue} WITH ACTIVATION (PROCEDURE_NAME={proc}, MAX_QUEUE_READERS=1, EXECUTE AS OWNER); END; \
          IF (SELECT COUNT(*) FROM sys.services WHERE NAME={name}) = 0 BEGIN \
          CREATE SERVICE {queue} ON QUEUE {queue} ([{contract}]); \
          IF (SELECT COUNT(*) FROM sys.database_principals WHERE name='sql_dependency_subscriber' AND type='R') <> 0 BEGIN \
          GRANT SEND ON SERVICE::{queue} TO sql_dependency_subscriber; END; END; \
          BEGIN DIALOG @dialog_handle FROM SERVICE {queue} TO SERVICE {name}; \
          SELECT @dialog_handle;",
         proc = escaped_procedure,
         queue = escaped_queue,
         name = name_literal,
         contract = POST_QUERY_NOTIFICATION_CONTRACT,
      );

      let session = Self::session_mut(&mut channel.session)?;
      session.begin_transaction().await?;

      let result: Result<Uuid> = async {
         if let Err(e) = session.execute(&create_procedure, &[]).await {
            if !restart || e.is_fatal() {
               return Err(e.into());
            }
            debug!(queue = %self.queue, error = %e, "Activation procedure not recreated");
            if let Err(e) = session.rollback().await {
               warn!(queue = %self.queue, error = %e, "Rollback after procedure creation failed");
            }
            session.begin_transaction().await?;
         }

         let rows = session.query(&create_queue_and_service, &[]).await?;
         let dialog = rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(SqlValue::as_guid)
            .ok_or_else(|| SessionError::server("BEGIN DIALOG returned no handle"))?;
         session.commit().await?;
         Ok(dialog)
      }
      .await;

      match result {
         Ok(dialog) => {
            channel
               .command
               .arm_conversation_timer(dialog, self.config.conversation_timer_secs);
            self.objects_created.store(true, Ordering::SeqCst);
            debug!(queue = %self.queue, dialog = %dialog, restart, "Provisioned queue and service");
            Ok(())
         }
         Err(e) => {
            if let Err(rollback) = session.rollback().await {
               trace!(queue = %self.queue, error = %rollback, "Rollback after failed provisioning");
            }
            Err(e)
         }
      }
   }

   /// Runs one receive batch and decodes its rows.
   async fn receive(&self, channel: &mut Channel) -> Result<Vec<Delivery>> {
      let (sql, params) = channel.command.batch();
      let session = Self::session_mut(&mut channel.session)?;
      match session.query(&sql, &params).await {
         Ok(rows) => Ok(self.process_rows(&mut channel.command, rows)),
         Err(e) => {
            channel.command.reset();
            Err(e.into())
         }
      }
   }

   fn process_rows(&self, command: &mut ReceiveCommand, rows: Vec<Row>) -> Vec<Delivery> {
      let mut deliveries = Vec::new();
      let mut handle = None;

      if self.state().is_stopping() {
         command.set_pending_handle(None);
         return deliveries;
      }

      for row in rows {
         let message_type = row.get(0).and_then(SqlValue::as_text).unwrap_or_default();
         trace!(queue = %self.queue, message_type = %message_type, "Row received");
         handle = row.get(1).and_then(SqlValue::as_guid);

         if !message_type.eq_ignore_ascii_case(QUERY_NOTIFICATION_MESSAGE_TYPE) {
            handle = None;
            debug!(queue = %self.queue, message_type = %message_type, "Ignoring non-notification message");
            continue;
         }

         let Some(payload) = row.get(2).and_then(SqlValue::as_text) else {
            warn!(queue = %self.queue, "Notification message has no payload");
            continue;
         };

         match parse_message(payload) {
            Ok(notification) => match notification.routing_key.clone() {
               Some(key) if key.contains(';') => deliveries.push((key, notification)),
               key => warn!(queue = %self.queue, key = ?key, "Dropping notification with unexpected key format"),
            },
            Err(e) => warn!(queue = %self.queue, error = %e, "Dropping malformed notification"),
         }
      }

      command.set_pending_handle(handle);
      deliveries
   }

   fn deliver(&self, deliveries: Vec<Delivery>) {
      if deliveries.is_empty() {
         return;
      }
      let Some(sink) = self.sink.upgrade() else {
         debug!(queue = %self.queue, count = deliveries.len(), "Sink dropped; discarding notifications");
         return;
      };
      for (key, notification) in deliveries {
         sink.route(&key, notification);
      }
   }

   fn session_mut(
      session: &mut Option<Box<dyn BrokerSession>>,
   ) -> Result<&mut Box<dyn BrokerSession>> {
      session
         .as_mut()
         .ok_or_else(|| SessionError::connection("listener session is closed").into())
   }

   async fn poll_loop(self: Arc<Self>) -> Result<()> {
      let mut state_rx = self.state_tx.subscribe();

      let result = loop {
         let outcome = tokio::select! {
            biased;
            _ = wait_for_stop(&mut state_rx) => None,
            result = async {
               let mut channel = self.channel.lock().await;
               self.receive(&mut channel).await
            } => Some(result),
         };

         match outcome {
            None => break Ok(()),
            Some(Ok(deliveries)) => self.deliver(deliveries),
            Some(Err(e)) if !e.is_recoverable() => break Err(e),
            Some(Err(e)) => {
               if self.state().is_stopping() {
                  break Ok(());
               }
               warn!(queue = %self.queue, error = %e, "Listener poll failed; recovering");
               self.error_state.store(true, Ordering::SeqCst);
               match self.recover(&mut state_rx).await {
                  Ok(true) => continue,
                  Ok(false) => break Ok(()),
                  Err(e) => break Err(e),
               }
            }
         }
      };

      if let Err(e) = &result {
         error!(queue = %self.queue, error = %e, "Unrecoverable listener failure");
         self.error_state.store(true, Ordering::SeqCst);
         return result;
      }

      self.teardown().await;
      result
   }

   /// Retries [`restart`](Self::restart) until it succeeds (`Ok(true)`) or a
   /// stop is observed (`Ok(false)`).
   async fn recover(&self, state_rx: &mut watch::Receiver<ListenerState>) -> Result<bool> {
      self.state_tx.send_if_modified(|state| {
         if *state == ListenerState::Listening {
            *state = ListenerState::Recovering;
            return true;
         }
         false
      });

      let mut attempt: u32 = 0;
      loop {
         attempt += 1;
         let result = tokio::select! {
            biased;
            _ = wait_for_stop(state_rx) => return Ok(false),
            result = self.restart() => result,
         };

         match result {
            Ok((deliveries, reprovision_failed)) => {
               if reprovision_failed {
                  self.invalidate_server_once();
               }
               self.error_state.store(false, Ordering::SeqCst);
               self.episode_invalidated.store(false, Ordering::SeqCst);
               self.state_tx.send_if_modified(|state| {
                  if *state == ListenerState::Recovering {
                     *state = ListenerState::Listening;
                     return true;
                  }
                  false
               });
               info!(queue = %self.queue, attempt, "Listener recovered");
               self.deliver(deliveries);
               return Ok(true);
            }
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) => {
               warn!(
                  queue = %self.queue,
                  attempt,
                  error = %e,
                  retry_in_secs = self.config.retry_interval_secs,
                  "Listener recovery failed"
               );
               self.invalidate_server_once();
               self.close_session().await;

               tokio::select! {
                  biased;
                  _ = wait_for_stop(state_rx) => return Ok(false),
                  _ = tokio::time::sleep(self.config.retry_interval()) => {}
               }
            }
         }
      }
   }

   /// Reconnects, repairs server objects if this listener created them, and
   /// repeats the zero-timeout receive.
   ///
   /// The flag reports a failed repair. Invalidation is left to the caller so
   /// that sinks never run while the channel is locked.
   async fn restart(&self) -> Result<(Vec<Delivery>, bool)> {
      let mut guard = self.channel.lock().await;
      let channel = &mut *guard;

      if let Some(mut session) = channel.session.take() {
         session.close().await;
      }

      let session = self
         .connector
         .connect(&self.connect_params, self.key.principal())
         .await?;
      channel.session = Some(session);

      let mut reprovision_failed = false;
      if self.objects_created.load(Ordering::SeqCst) {
         if let Err(e) = self.provision(channel, true).await {
            if !e.is_recoverable() {
               return Err(e);
            }
            warn!(queue = %self.queue, error = %e, "Failed to re-create queue and service");
            reprovision_failed = true;
         }
      }

      channel.command.set_timeout(Duration::ZERO);
      let deliveries = self.receive(channel).await?;
      channel.command.set_timeout(self.config.wait_timeout());
      Ok((deliveries, reprovision_failed))
   }

   /// Bulk-invalidates subscriptions on this server, once per failure episode.
   fn invalidate_server_once(&self) {
      if self.episode_invalidated.swap(true, Ordering::SeqCst) {
         return;
      }
      if let Some(sink) = self.sink.upgrade() {
         debug!(queue = %self.queue, server = %self.server, "Invalidating subscriptions bound to server");
         sink.invalidate_server(&self.server, Notification::server_failure());
      }
   }

   async fn close_session(&self) {
      let mut channel = self.channel.lock().await;
      if let Some(mut session) = channel.session.take() {
         session.close().await;
      }
   }

   /// Ends the open conversation, drops provisioned objects, and closes the session.
   ///
   /// Server-side cleanup is recorded as done only after it completes, so a
   /// teardown cancelled part way through is redone by the next one. Closing
   /// and the final state transition are safe to repeat.
   async fn teardown(&self) {
      let mut guard = self.channel.lock().await;
      let channel = &mut *guard;

      if !self.cleanup_done.load(Ordering::SeqCst) {
         let handle = channel.command.pending_handle();
         if let Some(session) = channel.session.as_mut() {
            self.cleanup_server(session, handle).await;
            self.cleanup_done.store(true, Ordering::SeqCst);
         }
      }

      if let Some(mut session) = channel.session.take() {
         session.close().await;
      }
      self.mark_stopped(channel);
   }

   async fn cleanup_server(&self, session: &mut Box<dyn BrokerSession>, handle: Option<Uuid>) {
      if let Some(handle) = handle {
         if let Err(e) = session
            .execute(END_CONVERSATION_SQL, &[("@p1", SqlValue::Guid(handle))])
            .await
         {
            debug!(queue = %self.queue, error = %e, "End conversation failed during teardown");
         }
      }

      let created = self.objects_created.load(Ordering::SeqCst);
      if let (true, false, Some(procedure)) =
         (created, self.in_error_state(), self.procedure.as_deref())
      {
         let queue = escape_identifier(&self.queue);
         let drop_sql = format!(
            "BEGIN TRANSACTION; DROP SERVICE {q}; DROP QUEUE {q}; DROP PROCEDURE {p}; COMMIT TRANSACTION;",
            q = queue,
            p = escape_identifier(procedure),
         );
         match session.execute(&drop_sql, &[]).await {
            Ok(_) => debug!(queue = %self.queue, "Dropped queue, service, and procedure"),
            Err(e) => warn!(queue = %self.queue, error = %e, "Failed to drop server objects"),
         }
      }
   }

   /// Drops the session without talking to the server. Used when teardown
   /// itself stalls; the activation procedure removes auto-provisioned
   /// objects once the dialog timer fires.
   async fn abandon(&self) {
      let mut guard = self.channel.lock().await;
      let channel = &mut *guard;
      drop(channel.session.take());
      self.mark_stopped(channel);
   }

   fn mark_stopped(&self, channel: &mut Channel) {
      channel.command.reset();
      self.state_tx.send_replace(ListenerState::Stopped);
      debug!(queue = %self.queue, "Listener connection stopped");
   }

   /// Adds a reference on behalf of `context_id`.
   ///
   /// Returns true when this is the context's first reference.
   ///
   /// # Errors
   ///
   /// Returns [`Error::Stopped`] once the listener has begun stopping.
   pub fn increment_ref(&self, context_id: &str) -> Result<bool> {
      let mut refs = self.refs.lock();
      if self.state().is_stopping() {
         return Err(Error::Stopped);
      }
      refs.global += 1;
      let count = refs.per_context.entry(context_id.to_string()).or_insert(0);
      *count += 1;
      let first = *count == 1;
      trace!(queue = %self.queue, context = %context_id, global = refs.global, "Incremented listener refs");
      Ok(first)
   }

   /// Releases one reference held by `context_id`.
   ///
   /// When the global count reaches zero the in-flight receive is cancelled
   /// and teardown is awaited for at most the configured stop timeout, after
   /// which it is forced. A forced teardown that stalls as well is abandoned
   /// after one more stop timeout. Returns whether the listener is fully
   /// stopped.
   ///
   /// # Errors
   ///
   /// Returns the error that ended the poll task when it failed
   /// unrecoverably. The listener is stopped by the time it is returned.
   pub async fn stop(&self, context_id: &str) -> Result<bool> {
      let reached_zero = {
         let mut refs = self.refs.lock();
         match refs.per_context.get_mut(context_id) {
            Some(count) => {
               *count -= 1;
               if *count == 0 {
                  refs.per_context.remove(context_id);
               }
            }
            None => {
               warn!(queue = %self.queue, context = %context_id, "Stop from a context that holds no reference");
               return Ok(self.is_stopped());
            }
         }
         refs.global = refs.global.saturating_sub(1);
         if refs.global == 0 {
            // Flip under the lock so a concurrent increment_ref cannot revive us.
            self.state_tx.send_if_modified(|state| {
               if state.is_stopping() {
                  return false;
               }
               *state = ListenerState::Stopping;
               true
            });
         }
         refs.global == 0
      };

      if !reached_zero {
         return Ok(false);
      }

      debug!(queue = %self.queue, "Last reference released; stopping listener");

      let poll_interval = self.config.stop_poll_interval();
      let waited = tokio::time::timeout(self.config.stop_timeout(), async {
         loop {
            if self.state() == ListenerState::Stopped {
               return true;
            }
            if self.in_error_state() || self.poll_task_finished() {
               return false;
            }
            tokio::time::sleep(poll_interval).await;
         }
      })
      .await;

      let mut failure = None;
      if !matches!(waited, Ok(true)) {
         debug!(
            queue = %self.queue,
            error_state = self.in_error_state(),
            "Forcing listener teardown"
         );
         let task = self.poll_task.lock().take();
         if let Some(task) = task {
            failure = self.reap(task).await;
         }
         if tokio::time::timeout(self.config.stop_timeout(), self.teardown())
            .await
            .is_err()
         {
            warn!(queue = %self.queue, "Teardown stalled; abandoning listener session");
            self.abandon().await;
         }
      }

      match failure {
         Some(e) => Err(e),
         None => Ok(self.is_stopped()),
      }
   }

   /// Collects the outcome of a finished poll task, or aborts a running one
   /// and waits until it has released the channel.
   async fn reap(&self, task: JoinHandle<Result<()>>) -> Option<Error> {
      if !task.is_finished() {
         task.abort();
      }
      match task.await {
         Ok(Ok(())) => None,
         Ok(Err(e)) => Some(e),
         Err(e) if e.is_panic() => {
            error!(queue = %self.queue, "Listener poll task panicked");
            Some(Error::Unrecoverable(format!("listener poll task panicked: {e}")))
         }
         Err(_) => None,
      }
   }

   /// Releases every reference `context_id` holds. Returns whether the
   /// listener is fully stopped afterwards.
   ///
   /// # Errors
   ///
   /// Propagates the poll task failure surfaced by [`stop`](Self::stop).
   pub async fn unload_context(&self, context_id: &str) -> Result<bool> {
      let count = self.context_ref_count(context_id);
      for _ in 0..count {
         self.stop(context_id).await?;
      }
      Ok(self.is_stopped())
   }

   fn poll_task_finished(&self) -> bool {
      self
         .poll_task
         .lock()
         .as_ref()
         .is_none_or(|task| task.is_finished())
   }

   pub fn key(&self) -> &ListenerKey {
      &self.key
   }

   pub fn state(&self) -> ListenerState {
      *self.state_tx.borrow()
   }

   /// Watch channel that observes lifecycle transitions.
   pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
      self.state_tx.subscribe()
   }

   pub fn is_stopped(&self) -> bool {
      self.state() == ListenerState::Stopped
   }

   pub fn in_error_state(&self) -> bool {
      self.error_state.load(Ordering::SeqCst)
   }

   pub fn server(&self) -> &str {
      &self.server
   }

   pub fn database(&self) -> &str {
      &self.database
   }

   pub fn queue(&self) -> &str {
      &self.queue
   }

   /// True when this listener created its own queue and service.
   pub fn auto_provisioned(&self) -> bool {
      self.procedure.is_some()
   }

   pub fn ref_count(&self) -> usize {
      self.refs.lock().global
   }

   pub fn context_ref_count(&self, context_id: &str) -> usize {
      self.refs.lock().per_context.get(context_id).copied().unwrap_or(0)
   }
}

async fn wait_for_stop(state_rx: &mut watch::Receiver<ListenerState>) {
   let _ = state_rx.wait_for(|state| state.is_stopping()).await;
}

impl std::fmt::Debug for ListenerConnection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ListenerConnection")
         .field("queue", &self.queue)
         .field("server", &self.server)
         .field("state", &self.state())
         .field("ref_count", &self.refs.lock().global)
         .field("error_state", &self.in_error_state())
         .finish()
   }
}
