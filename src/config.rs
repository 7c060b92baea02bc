use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for consumer dispatchers.
///
/// # Examples
///
/// ```
/// use query_notify::DispatcherConfig;
///
/// let config = DispatcherConfig {
///     sweep_interval_secs: 5,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
   /// How often expired subscriptions are swept (in seconds).
   ///
   /// The sweep only scans when the earliest known expiration has passed,
   /// so a short interval mostly costs a timestamp comparison.
   ///
   /// Default: 15
   pub sweep_interval_secs: u64,

   /// Lifetime of a subscription created without an explicit timeout (in seconds).
   ///
   /// Also sent to the server as the registration timeout.
   ///
   /// Default: 432000 (five days)
   pub default_timeout_secs: u64,
}

impl Default for DispatcherConfig {
   fn default() -> Self {
      Self {
         sweep_interval_secs: 15,
         default_timeout_secs: 432_000,
      }
   }
}

impl DispatcherConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
      self.sweep_interval_secs = interval.as_secs().max(1);
      self
   }

   pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
      self.default_timeout_secs = timeout.as_secs();
      self
   }

   pub fn sweep_interval(&self) -> Duration {
      Duration::from_secs(self.sweep_interval_secs.max(1))
   }

   pub fn default_timeout(&self) -> Duration {
      Duration::from_secs(self.default_timeout_secs)
   }
}
