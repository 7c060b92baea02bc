use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for listener connections.
///
/// Controls how long each receive waits on the server queue, how often a
/// failed listener retries recovery, how long a final stop waits for teardown,
/// and the name prefixes used when server objects are provisioned automatically.
///
/// # Examples
///
/// ```
/// use query_notify_listener::ListenerConfig;
///
/// // Use defaults
/// let config = ListenerConfig::default();
///
/// // Override just one field
/// let config = ListenerConfig {
///     retry_interval_secs: 10,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
   /// Timeout for each steady-state receive (in milliseconds).
   ///
   /// The initial receive issued during setup and recovery always uses a zero
   /// timeout so a misconfigured queue fails immediately.
   ///
   /// Default: 60000
   pub wait_timeout_ms: u64,

   /// Delay between recovery attempts after a listener failure (in seconds).
   ///
   /// Recovery is retried at this fixed interval until it succeeds or the
   /// listener is stopped.
   ///
   /// Default: 60
   pub retry_interval_secs: u64,

   /// Maximum time a final stop waits for teardown before forcing it (in seconds).
   ///
   /// Default: 30
   pub stop_timeout_secs: u64,

   /// Granularity of the stop wait (in milliseconds).
   ///
   /// Default: 1
   pub stop_poll_interval_ms: u64,

   /// Dialog timer armed on auto-provisioned queues (in seconds).
   ///
   /// When the timer fires and nobody is listening, the activation procedure
   /// drops the service, queue, and procedure.
   ///
   /// Default: 120
   pub conversation_timer_secs: u64,

   /// Prefix for auto-provisioned queue and service names.
   ///
   /// Default: "SqlQueryNotificationService"
   pub service_name_prefix: String,

   /// Prefix for auto-provisioned activation procedure names.
   ///
   /// Default: "SqlQueryNotificationStoredProcedure"
   pub procedure_name_prefix: String,
}

impl Default for ListenerConfig {
   fn default() -> Self {
      Self {
         wait_timeout_ms: 60_000,
         retry_interval_secs: 60,
         stop_timeout_secs: 30,
         stop_poll_interval_ms: 1,
         conversation_timer_secs: 120,
         service_name_prefix: "SqlQueryNotificationService".to_string(),
         procedure_name_prefix: "SqlQueryNotificationStoredProcedure".to_string(),
      }
   }
}

impl ListenerConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
      self.wait_timeout_ms = timeout.as_millis() as u64;
      self
   }

   pub fn with_retry_interval(mut self, interval: Duration) -> Self {
      self.retry_interval_secs = interval.as_secs();
      self
   }

   pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
      self.stop_timeout_secs = timeout.as_secs();
      self
   }

   pub fn with_name_prefixes(
      mut self,
      service: impl Into<String>,
      procedure: impl Into<String>,
   ) -> Self {
      self.service_name_prefix = service.into();
      self.procedure_name_prefix = procedure.into();
      self
   }

   pub fn wait_timeout(&self) -> Duration {
      Duration::from_millis(self.wait_timeout_ms)
   }

   pub fn retry_interval(&self) -> Duration {
      Duration::from_secs(self.retry_interval_secs)
   }

   pub fn stop_timeout(&self) -> Duration {
      Duration::from_secs(self.stop_timeout_secs)
   }

   pub fn stop_poll_interval(&self) -> Duration {
      Duration::from_millis(self.stop_poll_interval_ms.max(1))
   }
}
