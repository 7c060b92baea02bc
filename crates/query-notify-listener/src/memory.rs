//! In-process broker implementing [`Connector`] and [`BrokerSession`].
//!
//! Recognises the statement shapes a listener issues (broker check,
//! provisioning, receive, end conversation, drop) and keeps queues, services,
//! and procedures in memory. Failure injection hooks let callers exercise the
//! setup, recovery, and teardown paths without a server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::error::SessionError;
use crate::key::{ConnectionParams, Principal};
use crate::message::{
   NotificationSource, NotificationType, QUERY_NOTIFICATION_MESSAGE_TYPE, render_message,
};
use crate::session::{BrokerSession, Connector, SessionResult};
use crate::value::{Row, SqlParam, SqlValue};

static CREATE_PROCEDURE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^\s*CREATE PROCEDURE (\[(?:[^\]]|\]\])+\])").expect("procedure pattern is valid")
});
static CREATE_QUEUE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"CREATE QUEUE (\[(?:[^\]]|\]\])+\])").expect("queue pattern is valid")
});
static RECEIVE_FROM: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"WAITFOR\(RECEIVE .* from (\[(?:[^\]]|\]\])+\])\), TIMEOUT @p2;")
      .expect("receive pattern is valid")
});
static DROP_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"DROP (SERVICE|QUEUE|PROCEDURE) (\[(?:[^\]]|\]\])+\])").expect("drop pattern is valid")
});
static CONVERSATION_TIMER: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"BEGIN CONVERSATION TIMER \('([0-9a-fA-F-]{36})'\)").expect("timer pattern is valid")
});

fn unbracket(name: &str) -> String {
   name
      .strip_prefix('[')
      .and_then(|inner| inner.strip_suffix(']'))
      .unwrap_or(name)
      .replace("]]", "]")
}

fn lower(name: &str) -> String {
   name.to_lowercase()
}

/// A message waiting on an in-memory queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
   pub message_type: String,
   pub conversation: Uuid,
   pub body: String,
}

#[derive(Debug, Default)]
struct BrokerState {
   broker_disabled: bool,
   queues: HashMap<String, VecDeque<QueuedMessage>>,
   services: HashSet<String>,
   procedures: HashSet<String>,
   conversations: HashSet<Uuid>,
   timers_armed: usize,
   statements: Vec<String>,
   connects: usize,
   open_sessions: usize,
   connect_failures: usize,
   receive_failures: usize,
   fatal_receive: bool,
   provision_failures: usize,
}

#[derive(Debug, Default)]
struct BrokerInner {
   server: String,
   database: String,
   state: Mutex<BrokerState>,
   arrivals: Notify,
}

/// Shared in-memory server. Cloning yields another handle to the same server.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
   inner: Arc<BrokerInner>,
}

impl MemoryBroker {
   pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
      Self {
         inner: Arc::new(BrokerInner {
            server: server.into(),
            database: database.into(),
            state: Mutex::new(BrokerState::default()),
            arrivals: Notify::new(),
         }),
      }
   }

   pub fn server(&self) -> &str {
      &self.inner.server
   }

   pub fn set_broker_enabled(&self, enabled: bool) {
      self.inner.state.lock().broker_disabled = !enabled;
   }

   /// Creates a queue (and a service of the same name) ahead of time.
   pub fn create_queue(&self, name: &str) {
      let mut state = self.inner.state.lock();
      state.queues.entry(lower(name)).or_default();
      state.services.insert(lower(name));
   }

   /// Removes a queue as if dropped by an administrator.
   pub fn drop_queue(&self, name: &str) {
      let mut state = self.inner.state.lock();
      state.queues.remove(&lower(name));
      state.services.remove(&lower(name));
   }

   pub fn queue_exists(&self, name: &str) -> bool {
      self.inner.state.lock().queues.contains_key(&lower(name))
   }

   pub fn service_exists(&self, name: &str) -> bool {
      self.inner.state.lock().services.contains(&lower(name))
   }

   pub fn procedure_exists(&self, name: &str) -> bool {
      self.inner.state.lock().procedures.contains(&lower(name))
   }

   pub fn queue_names(&self) -> Vec<String> {
      self.inner.state.lock().queues.keys().cloned().collect()
   }

   /// Enqueues a raw message. Returns false if the queue does not exist.
   pub fn send(&self, queue: &str, message_type: &str, body: &str) -> bool {
      let conversation = Uuid::new_v4();
      {
         let mut state = self.inner.state.lock();
         let Some(messages) = state.queues.get_mut(&lower(queue)) else {
            return false;
         };
         messages.push_back(QueuedMessage {
            message_type: message_type.to_string(),
            conversation,
            body: body.to_string(),
         });
         state.conversations.insert(conversation);
      }
      self.inner.arrivals.notify_waiters();
      true
   }

   /// Enqueues a change notification for `routing_key`.
   pub fn send_notification(&self, queue: &str, info: &str, routing_key: &str) -> bool {
      let body = render_message(
         NotificationType::Change,
         NotificationSource::Data,
         info,
         routing_key,
      );
      self.send(queue, QUERY_NOTIFICATION_MESSAGE_TYPE, &body)
   }

   /// The next `count` connection attempts fail.
   pub fn fail_next_connects(&self, count: usize) {
      self.inner.state.lock().connect_failures = count;
   }

   /// The next `count` receives fail with a connection error.
   pub fn fail_next_receives(&self, count: usize) {
      self.inner.state.lock().receive_failures = count;
   }

   /// Every receive fails with a fatal error until cleared.
   pub fn fail_receives_fatally(&self, fatal: bool) {
      self.inner.state.lock().fatal_receive = fatal;
   }

   /// The next `count` queue and service provisioning batches fail.
   pub fn fail_next_provisions(&self, count: usize) {
      self.inner.state.lock().provision_failures = count;
   }

   /// Every statement received so far, in order.
   pub fn statements(&self) -> Vec<String> {
      self.inner.state.lock().statements.clone()
   }

   pub fn connect_count(&self) -> usize {
      self.inner.state.lock().connects
   }

   pub fn open_sessions(&self) -> usize {
      self.inner.state.lock().open_sessions
   }

   pub fn open_conversations(&self) -> usize {
      self.inner.state.lock().conversations.len()
   }

   pub fn timers_armed(&self) -> usize {
      self.inner.state.lock().timers_armed
   }
}

#[async_trait]
impl Connector for MemoryBroker {
   async fn connect(
      &self,
      params: &ConnectionParams,
      principal: Option<&Principal>,
   ) -> SessionResult<Box<dyn BrokerSession>> {
      let mut state = self.inner.state.lock();
      state.connects += 1;
      if state.connect_failures > 0 {
         state.connect_failures -= 1;
         return Err(SessionError::connection(format!(
            "cannot open connection to {}",
            self.inner.server
         )));
      }
      state.open_sessions += 1;
      trace!(params = %params, principal = ?principal, "Memory session opened");
      Ok(Box::new(MemorySession {
         inner: Arc::clone(&self.inner),
         open: true,
         staged: None,
      }))
   }
}

#[derive(Debug)]
enum Staged {
   Procedure(String),
   Queue(String),
   Service(String),
}

struct MemorySession {
   inner: Arc<BrokerInner>,
   open: bool,
   staged: Option<Vec<Staged>>,
}

impl MemorySession {
   fn check_open(&self) -> SessionResult<()> {
      if self.open {
         Ok(())
      } else {
         Err(SessionError::connection("connection is closed"))
      }
   }

   fn log(&self, sql: &str) {
      self.inner.state.lock().statements.push(sql.to_string());
   }

   fn stage(&mut self, object: Staged) {
      match &mut self.staged {
         Some(staged) => staged.push(object),
         None => Self::apply(&mut self.inner.state.lock(), object),
      }
   }

   fn apply(state: &mut BrokerState, object: Staged) {
      match object {
         Staged::Procedure(name) => {
            state.procedures.insert(name);
         }
         Staged::Queue(name) => {
            state.queues.entry(name).or_default();
         }
         Staged::Service(name) => {
            state.services.insert(name);
         }
      }
   }

   fn end_conversation(&self, params: &[SqlParam]) {
      let handle = params
         .iter()
         .find(|(name, _)| *name == "@p1")
         .and_then(|(_, value)| value.as_guid());
      if let Some(handle) = handle {
         self.inner.state.lock().conversations.remove(&handle);
      }
   }

   fn create_procedure(&mut self, name: &str) -> SessionResult<u64> {
      let key = lower(&unbracket(name));
      let exists = self.inner.state.lock().procedures.contains(&key)
         || self
            .staged
            .iter()
            .flatten()
            .any(|s| matches!(s, Staged::Procedure(p) if *p == key));
      if exists {
         return Err(SessionError::server(format!(
            "There is already an object named '{}' in the database.",
            unbracket(name)
         )));
      }
      self.stage(Staged::Procedure(key));
      Ok(0)
   }

   fn create_queue_and_service(&mut self, name: &str) -> SessionResult<Vec<Row>> {
      {
         let mut state = self.inner.state.lock();
         if state.provision_failures > 0 {
            state.provision_failures -= 1;
            return Err(SessionError::server("CREATE QUEUE failed"));
         }
      }
      let key = lower(&unbracket(name));
      let (has_queue, has_service) = {
         let state = self.inner.state.lock();
         (state.queues.contains_key(&key), state.services.contains(&key))
      };
      if !has_queue {
         self.stage(Staged::Queue(key.clone()));
      }
      if !has_service {
         self.stage(Staged::Service(key));
      }
      let dialog = Uuid::new_v4();
      self.inner.state.lock().conversations.insert(dialog);
      Ok(vec![Row::new(vec![SqlValue::Guid(dialog)])])
   }

   fn drop_objects(&self, sql: &str) -> u64 {
      let mut state = self.inner.state.lock();
      let mut dropped = 0;
      for captures in DROP_OBJECT.captures_iter(sql) {
         let name = lower(&unbracket(&captures[2]));
         let removed = match &captures[1] {
            "SERVICE" => state.services.remove(&name),
            "QUEUE" => state.queues.remove(&name).is_some(),
            _ => state.procedures.remove(&name),
         };
         if removed {
            dropped += 1;
         }
      }
      dropped
   }

   async fn receive(&self, queue: &str, params: &[SqlParam]) -> SessionResult<Vec<Row>> {
      let key = lower(&unbracket(queue));
      let timeout_ms = params
         .iter()
         .find(|(name, _)| *name == "@p2")
         .and_then(|(_, value)| value.as_integer())
         .unwrap_or(0)
         .max(0) as u64;
      let deadline = Instant::now() + Duration::from_millis(timeout_ms);

      {
         let mut state = self.inner.state.lock();
         if state.fatal_receive {
            return Err(SessionError::fatal("receive aborted"));
         }
         if state.receive_failures > 0 {
            state.receive_failures -= 1;
            return Err(SessionError::connection("transport-level error while receiving"));
         }
      }

      loop {
         let notified = self.inner.arrivals.notified();
         tokio::pin!(notified);
         notified.as_mut().enable();

         {
            let mut state = self.inner.state.lock();
            let Some(messages) = state.queues.get_mut(&key) else {
               return Err(SessionError::server(format!(
                  "Cannot find the queue '{}'.",
                  unbracket(queue)
               )));
            };
            if let Some(message) = messages.pop_front() {
               return Ok(vec![Row::new(vec![
                  SqlValue::Text(message.message_type),
                  SqlValue::Guid(message.conversation),
                  SqlValue::Xml(message.body),
               ])]);
            }
         }

         if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return Ok(Vec::new());
         }
      }
   }
}

#[async_trait]
impl BrokerSession for MemorySession {
   fn server(&self) -> &str {
      &self.inner.server
   }

   fn database(&self) -> &str {
      &self.inner.database
   }

   async fn query(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<Vec<Row>> {
      self.check_open()?;
      self.log(sql);

      if sql.contains("is_broker_enabled") {
         let enabled = !self.inner.state.lock().broker_disabled;
         return Ok(vec![Row::new(vec![SqlValue::Bool(enabled)])]);
      }

      if let Some(captures) = CREATE_QUEUE.captures(sql) {
         return self.create_queue_and_service(&captures[1]);
      }

      if let Some(captures) = RECEIVE_FROM.captures(sql) {
         if sql.starts_with("END CONVERSATION @p1;") {
            self.end_conversation(params);
         }
         if CONVERSATION_TIMER.is_match(sql) {
            self.inner.state.lock().timers_armed += 1;
         }
         let queue = captures[1].to_string();
         return self.receive(&queue, params).await;
      }

      Ok(Vec::new())
   }

   async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<u64> {
      self.check_open()?;
      self.log(sql);

      if let Some(captures) = CREATE_PROCEDURE.captures(sql) {
         let name = captures[1].to_string();
         return self.create_procedure(&name);
      }
      if sql.trim_start().starts_with("END CONVERSATION @p1;") {
         self.end_conversation(params);
         return Ok(1);
      }
      if DROP_OBJECT.is_match(sql) {
         return Ok(self.drop_objects(sql));
      }
      Ok(0)
   }

   async fn begin_transaction(&mut self) -> SessionResult<()> {
      self.check_open()?;
      self.staged = Some(Vec::new());
      Ok(())
   }

   async fn commit(&mut self) -> SessionResult<()> {
      self.check_open()?;
      if let Some(staged) = self.staged.take() {
         let mut state = self.inner.state.lock();
         for object in staged {
            Self::apply(&mut state, object);
         }
      }
      Ok(())
   }

   async fn rollback(&mut self) -> SessionResult<()> {
      self.check_open()?;
      self.staged = None;
      Ok(())
   }

   async fn close(&mut self) {
      if self.open {
         self.open = false;
         self.staged = None;
         self.inner.state.lock().open_sessions -= 1;
      }
   }
}

impl Drop for MemorySession {
   fn drop(&mut self) {
      if self.open {
         self.inner.state.lock().open_sessions -= 1;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   async fn session(broker: &MemoryBroker) -> Box<dyn BrokerSession> {
      broker.connect(&ConnectionParams::new(), None).await.unwrap()
   }

   #[tokio::test]
   async fn test_receive_returns_queued_message() {
      let broker = MemoryBroker::new("srv", "app");
      broker.create_queue("q");
      assert!(broker.send_notification("q", "insert", "ctx;1"));

      let mut s = session(&broker).await;
      let rows = s
         .query(
            "WAITFOR(RECEIVE TOP (1) message_type_name, conversation_handle, cast(message_body AS XML) as message_body from [q]), TIMEOUT @p2;",
            &[("@p2", SqlValue::Integer(0))],
         )
         .await
         .unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0].get(0).and_then(SqlValue::as_text), Some(QUERY_NOTIFICATION_MESSAGE_TYPE));
   }

   #[tokio::test(start_paused = true)]
   async fn test_receive_times_out_empty() {
      let broker = MemoryBroker::new("srv", "app");
      broker.create_queue("q");
      let mut s = session(&broker).await;
      let rows = s
         .query(
            "WAITFOR(RECEIVE TOP (1) message_type_name, conversation_handle, cast(message_body AS XML) as message_body from [q]), TIMEOUT @p2;",
            &[("@p2", SqlValue::Integer(5_000))],
         )
         .await
         .unwrap();
      assert!(rows.is_empty());
   }

   #[tokio::test]
   async fn test_rollback_discards_staged_objects() {
      let broker = MemoryBroker::new("srv", "app");
      let mut s = session(&broker).await;
      s.begin_transaction().await.unwrap();
      s.execute("CREATE PROCEDURE [p] AS BEGIN END", &[]).await.unwrap();
      s.rollback().await.unwrap();
      assert!(!broker.procedure_exists("p"));
   }

   #[tokio::test]
   async fn test_connect_failure_injection() {
      let broker = MemoryBroker::new("srv", "app");
      broker.fail_next_connects(1);
      assert!(broker.connect(&ConnectionParams::new(), None).await.is_err());
      assert!(broker.connect(&ConnectionParams::new(), None).await.is_ok());
      assert_eq!(broker.connect_count(), 2);
   }
}
