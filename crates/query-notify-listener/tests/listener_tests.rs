//! Integration tests for listener connections against the in-memory broker.
//!
//! Tests verify:
//! - Setup: auto-provisioning, pre-provisioned queues, failure unwinding
//! - Reference counting: stop only tears down at zero, per-context unload
//! - Message handling: routing, non-notification messages, malformed payloads
//! - Recovery: reconnect after poll failure, one bulk invalidation per episode
//! - Stop: forced teardown in error state, stalled teardown, fatal failures

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use query_notify_listener::{
   BrokerSession, ConnectionParams, Connector, Error, ListenerConfig, ListenerConnection,
   ListenerKey, ListenerState, MemoryBroker, Notification, NotificationInfo, NotificationSink,
   NotificationSource, Principal, QUERY_NOTIFICATION_MESSAGE_TYPE, Row, SessionResult, SqlParam,
};
use tokio::time::{Instant, timeout};

fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_test_writer()
      .try_init();
}

#[derive(Default)]
struct RecordingSink {
   routed: Mutex<Vec<(String, Notification)>>,
   invalidated: Mutex<Vec<(String, Notification)>>,
}

impl NotificationSink for RecordingSink {
   fn route(&self, routing_key: &str, notification: Notification) {
      self.routed.lock().push((routing_key.to_string(), notification));
   }

   fn invalidate_server(&self, server: &str, notification: Notification) {
      self
         .invalidated
         .lock()
         .push((server.to_string(), notification));
   }
}

impl RecordingSink {
   fn routed_keys(&self) -> Vec<String> {
      self.routed.lock().iter().map(|(k, _)| k.clone()).collect()
   }
}

fn params() -> ConnectionParams {
   ConnectionParams::parse("Data Source=db1;Initial Catalog=app")
}

async fn start(
   broker: &MemoryBroker,
   sink: &Arc<RecordingSink>,
   queue: Option<&str>,
) -> query_notify_listener::Result<Arc<ListenerConnection>> {
   start_with(Arc::new(broker.clone()), sink, queue).await
}

async fn start_with(
   connector: Arc<dyn Connector>,
   sink: &Arc<RecordingSink>,
   queue: Option<&str>,
) -> query_notify_listener::Result<Arc<ListenerConnection>> {
   init_tracing();
   let sink: Arc<dyn NotificationSink> = sink.clone();
   ListenerConnection::create(
      ListenerKey::new(None, &params(), queue),
      connector,
      Arc::downgrade(&sink),
      ListenerConfig::default(),
   )
   .await
}

/// Hands out memory sessions whose `execute` hangs while stalls remain.
struct StallingConnector {
   broker: MemoryBroker,
   stalls: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for StallingConnector {
   async fn connect(
      &self,
      params: &ConnectionParams,
      principal: Option<&Principal>,
   ) -> SessionResult<Box<dyn BrokerSession>> {
      let inner = self.broker.connect(params, principal).await?;
      Ok(Box::new(StallingSession {
         inner,
         stalls: Arc::clone(&self.stalls),
      }))
   }
}

struct StallingSession {
   inner: Box<dyn BrokerSession>,
   stalls: Arc<AtomicUsize>,
}

#[async_trait]
impl BrokerSession for StallingSession {
   fn server(&self) -> &str {
      self.inner.server()
   }

   fn database(&self) -> &str {
      self.inner.database()
   }

   async fn query(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<Vec<Row>> {
      self.inner.query(sql, params).await
   }

   async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> SessionResult<u64> {
      let stall = self
         .stalls
         .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
         .is_ok();
      if stall {
         std::future::pending::<()>().await;
      }
      self.inner.execute(sql, params).await
   }

   async fn begin_transaction(&mut self) -> SessionResult<()> {
      self.inner.begin_transaction().await
   }

   async fn commit(&mut self) -> SessionResult<()> {
      self.inner.commit().await
   }

   async fn rollback(&mut self) -> SessionResult<()> {
      self.inner.rollback().await
   }

   async fn close(&mut self) {
      self.inner.close().await
   }
}

async fn start_stalling(
   broker: &MemoryBroker,
   sink: &Arc<RecordingSink>,
) -> (Arc<ListenerConnection>, Arc<AtomicUsize>) {
   let stalls = Arc::new(AtomicUsize::new(0));
   let connector = StallingConnector {
      broker: broker.clone(),
      stalls: Arc::clone(&stalls),
   };
   let listener = start_with(Arc::new(connector), sink, None).await.unwrap();
   (listener, stalls)
}

async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) {
   timeout(within, async {
      while !condition() {
         tokio::time::sleep(Duration::from_millis(5)).await;
      }
   })
   .await
   .expect("condition not reached in time");
}

// ============================================================================
// Setup
// ============================================================================

#[tokio::test]
async fn test_create_auto_provisions_queue_service_and_procedure() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());

   let listener = start(&broker, &sink, None).await.unwrap();

   assert!(listener.auto_provisioned());
   assert!(listener.queue().starts_with("SqlQueryNotificationService-"));
   assert_eq!(listener.server(), "db1");
   assert_eq!(listener.database(), "app");
   assert_eq!(listener.state(), ListenerState::Listening);
   assert!(broker.queue_exists(listener.queue()));
   assert!(broker.service_exists(listener.queue()));

   let procedure = listener
      .queue()
      .replace("SqlQueryNotificationService", "SqlQueryNotificationStoredProcedure");
   assert!(broker.procedure_exists(&procedure));

   // The first receive batch re-arms the dialog timer used for self-cleanup.
   assert!(broker.timers_armed() >= 1);
}

#[tokio::test]
async fn test_create_with_existing_queue() {
   let broker = MemoryBroker::new("db1", "app");
   broker.create_queue("orders");
   let sink = Arc::new(RecordingSink::default());

   let listener = start(&broker, &sink, Some("orders")).await.unwrap();
   assert!(!listener.auto_provisioned());
   assert_eq!(listener.queue(), "orders");

   listener.increment_ref("ctx").unwrap();
   assert!(listener.stop("ctx").await.unwrap());

   // Caller-owned queues survive teardown.
   assert!(broker.queue_exists("orders"));
   assert_eq!(broker.timers_armed(), 0);
}

#[tokio::test]
async fn test_missing_queue_fails_setup_and_closes_session() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());

   let err = start(&broker, &sink, Some("nope")).await.unwrap_err();
   assert_eq!(err.error_code(), "SETUP_FAILED");
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_broker_disabled_fails_setup() {
   let broker = MemoryBroker::new("db1", "app");
   broker.set_broker_enabled(false);
   let sink = Arc::new(RecordingSink::default());

   let err = start(&broker, &sink, None).await.unwrap_err();
   match err {
      Error::SetupFailed { source, .. } => {
         assert!(matches!(*source, Error::BrokerDisabled { ref database } if database == "app"));
      }
      other => panic!("unexpected error: {other:?}"),
   }
   assert!(broker.queue_names().is_empty());
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_provisioning_failure_leaves_nothing_behind() {
   let broker = MemoryBroker::new("db1", "app");
   broker.fail_next_provisions(1);
   let sink = Arc::new(RecordingSink::default());

   assert!(start(&broker, &sink, None).await.is_err());
   assert!(broker.queue_names().is_empty());
   assert_eq!(broker.open_sessions(), 0);
   assert!(
      !broker
         .statements()
         .iter()
         .any(|s| s.starts_with("BEGIN TRANSACTION; DROP SERVICE"))
   );
}

#[tokio::test]
async fn test_connect_failure_fails_setup() {
   let broker = MemoryBroker::new("db1", "app");
   broker.fail_next_connects(1);
   let sink = Arc::new(RecordingSink::default());

   let err = start(&broker, &sink, None).await.unwrap_err();
   assert!(err.to_string().contains("cannot open connection"));
}

// ============================================================================
// Reference Counting
// ============================================================================

#[tokio::test]
async fn test_stop_tears_down_only_at_zero_refs() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();

   assert!(listener.increment_ref("ctx").unwrap());
   assert!(!listener.increment_ref("ctx").unwrap());
   assert_eq!(listener.ref_count(), 2);

   assert!(!listener.stop("ctx").await.unwrap());
   assert_eq!(listener.state(), ListenerState::Listening);
   assert!(broker.queue_exists(listener.queue()));

   assert!(listener.stop("ctx").await.unwrap());
   assert_eq!(listener.state(), ListenerState::Stopped);
   assert!(!broker.queue_exists(listener.queue()));
   assert!(!broker.service_exists(listener.queue()));
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_increment_after_stop_is_rejected() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();

   listener.increment_ref("ctx").unwrap();
   assert!(listener.stop("ctx").await.unwrap());
   assert!(matches!(listener.increment_ref("ctx"), Err(Error::Stopped)));
}

#[tokio::test]
async fn test_unload_context_releases_all_of_its_refs() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();

   listener.increment_ref("a").unwrap();
   listener.increment_ref("a").unwrap();
   listener.increment_ref("b").unwrap();
   assert_eq!(listener.context_ref_count("a"), 2);

   assert!(!listener.unload_context("a").await.unwrap());
   assert_eq!(listener.context_ref_count("a"), 0);
   assert_eq!(listener.ref_count(), 1);

   assert!(listener.unload_context("b").await.unwrap());
   assert!(listener.is_stopped());
}

#[tokio::test]
async fn test_stop_from_unknown_context_is_ignored() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();

   listener.increment_ref("a").unwrap();
   assert!(!listener.stop("other").await.unwrap());
   assert_eq!(listener.ref_count(), 1);
   listener.stop("a").await.unwrap();
}

// ============================================================================
// Message Handling
// ============================================================================

#[tokio::test]
async fn test_notification_is_routed_with_its_key() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();

   assert!(broker.send_notification(listener.queue(), "insert", "ctx;abc"));
   eventually(Duration::from_secs(5), || !sink.routed.lock().is_empty()).await;

   let (key, notification) = sink.routed.lock()[0].clone();
   assert_eq!(key, "ctx;abc");
   assert_eq!(notification.info, NotificationInfo::Insert);
   assert_eq!(notification.source, NotificationSource::Data);

   // The next receive ends the conversation in the same round trip.
   eventually(Duration::from_secs(5), || {
      broker
         .statements()
         .iter()
         .any(|s| s.starts_with("END CONVERSATION @p1; BEGIN CONVERSATION TIMER"))
   })
   .await;

   listener.stop("ctx").await.unwrap();
}

#[tokio::test]
async fn test_non_notification_and_malformed_messages_are_skipped() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();
   let queue = listener.queue().to_string();

   broker.send(
      &queue,
      "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer",
      "",
   );
   broker.send(
      &queue,
      QUERY_NOTIFICATION_MESSAGE_TYPE,
      r#"<qn:QueryNotification xmlns:qn="x" id="1" type="Change" source="Statement"><qn:Message>ctx;bad</qn:Message></qn:QueryNotification>"#,
   );
   broker.send_notification(&queue, "update", "no-delimiter");
   broker.send_notification(&queue, "delete", "ctx;good");

   eventually(Duration::from_secs(5), || !sink.routed.lock().is_empty()).await;
   assert_eq!(sink.routed_keys(), vec!["ctx;good".to_string()]);
   assert_eq!(listener.state(), ListenerState::Listening);

   listener.stop("ctx").await.unwrap();
}

#[tokio::test]
async fn test_messages_queued_before_start_arrive_during_setup() {
   let broker = MemoryBroker::new("db1", "app");
   broker.create_queue("orders");
   broker.send_notification("orders", "truncate", "ctx;early");
   let sink = Arc::new(RecordingSink::default());

   let listener = start(&broker, &sink, Some("orders")).await.unwrap();
   assert_eq!(sink.routed_keys(), vec!["ctx;early".to_string()]);

   listener.increment_ref("ctx").unwrap();
   listener.stop("ctx").await.unwrap();
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_poll_failure_recovers_without_invalidation() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();
   let connects = broker.connect_count();

   // The waiting receive returns the first message; the next one fails and
   // the receive after reconnecting picks up the second.
   broker.fail_next_receives(1);
   broker.send_notification(listener.queue(), "insert", "ctx;before");
   broker.send_notification(listener.queue(), "insert", "ctx;after");

   eventually(Duration::from_secs(5), || sink.routed.lock().len() == 2).await;
   assert_eq!(sink.routed_keys(), vec!["ctx;before".to_string(), "ctx;after".to_string()]);
   assert_eq!(broker.connect_count(), connects + 1);
   assert!(sink.invalidated.lock().is_empty());
   assert_eq!(listener.state(), ListenerState::Listening);
   assert!(!listener.in_error_state());

   listener.stop("ctx").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_recovery_failures_invalidate_once() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();

   // Poll fails, then three recovery attempts fail to reconnect.
   broker.fail_next_connects(3);
   broker.fail_next_receives(1);
   broker.send_notification(listener.queue(), "insert", "ctx;wake");

   eventually(Duration::from_secs(600), || broker.connect_count() == 5).await;
   eventually(Duration::from_secs(600), || {
      listener.state() == ListenerState::Listening
   })
   .await;

   let invalidated = sink.invalidated.lock().clone();
   assert_eq!(invalidated.len(), 1);
   assert_eq!(invalidated[0].0, "db1");
   assert_eq!(invalidated[0].1, Notification::server_failure());
   assert!(!listener.in_error_state());

   listener.stop("ctx").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_recovery_recreates_dropped_queue() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();
   let queue = listener.queue().to_string();

   broker.drop_queue(&queue);
   broker.fail_next_receives(1);

   eventually(Duration::from_secs(600), || broker.queue_exists(&queue)).await;
   eventually(Duration::from_secs(600), || {
      listener.state() == ListenerState::Listening
   })
   .await;

   assert!(broker.send_notification(&queue, "insert", "ctx;back"));
   eventually(Duration::from_secs(5), || !sink.routed.lock().is_empty()).await;

   listener.stop("ctx").await.unwrap();
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_during_recovery_forces_teardown() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();
   let queue = listener.queue().to_string();

   broker.fail_next_connects(usize::MAX);
   broker.fail_next_receives(1);
   broker.send_notification(&queue, "insert", "ctx;wake");

   eventually(Duration::from_secs(600), || listener.in_error_state()).await;
   assert!(listener.stop("ctx").await.unwrap());
   assert_eq!(listener.state(), ListenerState::Stopped);
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test]
async fn test_fatal_receive_ends_poll_task() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let listener = start(&broker, &sink, None).await.unwrap();
   listener.increment_ref("ctx").unwrap();

   broker.fail_receives_fatally(true);
   broker.send_notification(listener.queue(), "insert", "ctx;wake");

   eventually(Duration::from_secs(5), || listener.in_error_state()).await;
   assert!(sink.invalidated.lock().is_empty());

   // The failure that ended the poll task reaches whoever stops the listener.
   let err = listener.stop("ctx").await.unwrap_err();
   assert_eq!(err.error_code(), "SESSION_FATAL_ERROR");
   assert!(!err.is_recoverable());
   assert_eq!(listener.state(), ListenerState::Stopped);
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_teardown_is_forced_after_stop_timeout() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let (listener, stalls) = start_stalling(&broker, &sink).await;
   listener.increment_ref("ctx").unwrap();
   let queue = listener.queue().to_string();
   let stop_timeout = ListenerConfig::default().stop_timeout();

   // The poll task's own cleanup hangs; the forced teardown goes through.
   stalls.store(1, Ordering::SeqCst);
   let started = Instant::now();
   assert!(listener.stop("ctx").await.unwrap());
   let elapsed = started.elapsed();

   assert!(elapsed >= stop_timeout, "{elapsed:?}");
   assert!(elapsed < stop_timeout + Duration::from_secs(1), "{elapsed:?}");
   assert_eq!(listener.state(), ListenerState::Stopped);

   // Cleanup interrupted by the abort is redone rather than skipped.
   assert!(!broker.queue_exists(&queue));
   assert!(!broker.service_exists(&queue));
   assert_eq!(broker.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_that_never_finishes_is_abandoned() {
   let broker = MemoryBroker::new("db1", "app");
   let sink = Arc::new(RecordingSink::default());
   let (listener, stalls) = start_stalling(&broker, &sink).await;
   listener.increment_ref("ctx").unwrap();
   let queue = listener.queue().to_string();
   let stop_timeout = ListenerConfig::default().stop_timeout();

   stalls.store(usize::MAX, Ordering::SeqCst);
   let started = Instant::now();
   assert!(listener.stop("ctx").await.unwrap());
   let elapsed = started.elapsed();

   assert!(elapsed >= stop_timeout * 2, "{elapsed:?}");
   assert!(elapsed < stop_timeout * 2 + Duration::from_secs(1), "{elapsed:?}");
   assert_eq!(listener.state(), ListenerState::Stopped);
   assert_eq!(broker.open_sessions(), 0);

   // Server objects are left for the activation procedure to remove.
   assert!(broker.queue_exists(&queue));
}
