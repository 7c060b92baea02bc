//! Listener identity and connection parameters.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

const POOLING: &str = "Pooling";
const ENLIST: &str = "Enlist";
const CONNECT_RETRY_COUNT: &str = "ConnectRetryCount";
const ASYNC_PROCESSING: &str = "Asynchronous Processing";
const APPLICATION_NAME: &str = "Application Name";
const INTEGRATED_SECURITY: &str = "Integrated Security";
const DATA_SOURCE: &str = "Data Source";
const INITIAL_CATALOG: &str = "Initial Catalog";

/// Ordered set of connection parameters.
///
/// Keys are matched case-insensitively; the first spelling used for a key is
/// kept. Interpreting the parameters is left to the [`Connector`](crate::Connector).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParams {
   entries: Vec<(String, String)>,
}

impl ConnectionParams {
   pub fn new() -> Self {
      Self::default()
   }

   /// Parses `key=value` pairs separated by `;`. Empty segments are skipped.
   pub fn parse(connection_string: &str) -> Self {
      let mut params = Self::new();
      for segment in connection_string.split(';') {
         let Some((key, value)) = segment.split_once('=') else {
            continue;
         };
         let key = key.trim();
         if key.is_empty() {
            continue;
         }
         params.set(key, value.trim());
      }
      params
   }

   /// Sets a parameter, replacing any existing value for the same key.
   pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
      let key = key.into();
      let value = value.into();
      match self
         .entries
         .iter_mut()
         .find(|(k, _)| k.eq_ignore_ascii_case(&key))
      {
         Some(entry) => entry.1 = value,
         None => self.entries.push((key, value)),
      }
      self
   }

   pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
      self.set(key, value);
      self
   }

   pub fn get(&self, key: &str) -> Option<&str> {
      self
         .entries
         .iter()
         .find(|(k, _)| k.eq_ignore_ascii_case(key))
         .map(|(_, v)| v.as_str())
   }

   pub fn data_source(&self) -> Option<&str> {
      self.get(DATA_SOURCE)
   }

   pub fn initial_catalog(&self) -> Option<&str> {
      self.get(INITIAL_CATALOG)
   }

   /// True when the connection authenticates as the calling principal.
   pub fn integrated_security(&self) -> bool {
      self.get(INTEGRATED_SECURITY).is_some_and(|v| {
         v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("sspi") || v.eq_ignore_ascii_case("yes")
      })
   }

   /// The parameters a dedicated listener connection actually opens with.
   ///
   /// Pooling, enlistment, and connect retries are disabled, asynchronous
   /// processing is enabled, and the application name is set to the queue
   /// name when one is given.
   pub fn for_listener(&self, queue: Option<&str>) -> Self {
      let mut effective = self.clone();
      effective
         .set(POOLING, "False")
         .set(ENLIST, "False")
         .set(CONNECT_RETRY_COUNT, "0")
         .set(ASYNC_PROCESSING, "True");
      if let Some(queue) = queue {
         effective.set(APPLICATION_NAME, queue);
      }
      effective
   }

   /// Canonical `key=value;...` rendering used for identity comparison.
   pub fn to_connection_string(&self) -> String {
      self
         .entries
         .iter()
         .map(|(k, v)| format!("{}={}", k, v))
         .collect::<Vec<_>>()
         .join(";")
   }

   pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
      self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
   }
}

impl fmt::Display for ConnectionParams {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.to_connection_string())
   }
}

/// Identity a listener connection runs as when integrated security is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal(String);

impl Principal {
   pub fn new(name: impl Into<String>) -> Self {
      Self(name.into())
   }

   pub fn name(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for Principal {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Deduplication key for listener connections.
///
/// Two keys are equal when their principals match (or are both absent), their
/// effective connection strings match exactly, and their queue names match
/// ignoring case. A `None` queue means the listener provisions its own.
#[derive(Debug, Clone)]
pub struct ListenerKey {
   principal: Option<Principal>,
   params: ConnectionParams,
   queue: Option<String>,
}

impl ListenerKey {
   /// Builds a key from caller parameters.
   ///
   /// The stored parameters are the effective listener parameters without the
   /// application name, which is applied at connect time from the resolved queue.
   pub fn new(principal: Option<Principal>, params: &ConnectionParams, queue: Option<&str>) -> Self {
      // Only integrated-security connections carry the caller's identity.
      let principal = principal.filter(|_| params.integrated_security());
      Self {
         principal,
         params: params.for_listener(None),
         queue: queue.map(str::to_string),
      }
   }

   pub fn principal(&self) -> Option<&Principal> {
      self.principal.as_ref()
   }

   pub fn params(&self) -> &ConnectionParams {
      &self.params
   }

   pub fn queue(&self) -> Option<&str> {
      self.queue.as_deref()
   }

   /// True when the listener must create its own queue, service, and procedure.
   pub fn auto_provision(&self) -> bool {
      self.queue.is_none()
   }
}

impl PartialEq for ListenerKey {
   fn eq(&self, other: &Self) -> bool {
      let queues_match = match (&self.queue, &other.queue) {
         (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
         (None, None) => true,
         _ => false,
      };
      self.principal == other.principal
         && queues_match
         && self.params.to_connection_string() == other.params.to_connection_string()
   }
}

impl Eq for ListenerKey {}

impl Hash for ListenerKey {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.principal.hash(state);
      self.params.to_connection_string().hash(state);
      self.queue.as_ref().map(|q| q.to_ascii_lowercase()).hash(state);
   }
}

/// Quotes an object name as a bracketed identifier.
pub fn escape_identifier(name: &str) -> String {
   format!("[{}]", name.replace(']', "]]"))
}

/// Quotes a value as a Unicode string literal.
pub fn string_literal(value: &str) -> String {
   format!("N'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
   use std::collections::hash_map::DefaultHasher;

   use super::*;

   fn hash_of(key: &ListenerKey) -> u64 {
      let mut hasher = DefaultHasher::new();
      key.hash(&mut hasher);
      hasher.finish()
   }

   fn params() -> ConnectionParams {
      ConnectionParams::parse("Data Source=db1;Initial Catalog=app;Integrated Security=true")
   }

   #[test]
   fn test_parse_and_get_are_case_insensitive() {
      let p = params();
      assert_eq!(p.get("data source"), Some("db1"));
      assert_eq!(p.initial_catalog(), Some("app"));
      assert!(p.integrated_security());
   }

   #[test]
   fn test_for_listener_overrides() {
      let p = params().with("pooling", "true").for_listener(Some("q1"));
      assert_eq!(p.get(POOLING), Some("False"));
      assert_eq!(p.get(ENLIST), Some("False"));
      assert_eq!(p.get(CONNECT_RETRY_COUNT), Some("0"));
      assert_eq!(p.get(ASYNC_PROCESSING), Some("True"));
      assert_eq!(p.get(APPLICATION_NAME), Some("q1"));
      // Original spelling of the key is preserved.
      assert!(p.to_connection_string().contains("pooling=False"));
   }

   #[test]
   fn test_key_queue_is_case_insensitive() {
      let principal = Some(Principal::new("alice"));
      let a = ListenerKey::new(principal.clone(), &params(), Some("Orders"));
      let b = ListenerKey::new(principal, &params(), Some("ORDERS"));
      assert_eq!(a, b);
      assert_eq!(hash_of(&a), hash_of(&b));
      assert!(a.params().get(APPLICATION_NAME).is_none());

      let c = ListenerKey::new(None, &params(), None);
      assert_ne!(a, c);
      assert_eq!(c, ListenerKey::new(None, &params(), None));
   }

   #[test]
   fn test_key_equality_properties() {
      let mut a = ListenerKey::new(Some(Principal::new("alice")), &params(), Some("q"));
      let mut b = a.clone();
      let mut c = a.clone();
      b.queue = Some("Q".into());
      c.queue = Some("q".into());

      assert_eq!(a, a);
      assert_eq!(a, b);
      assert_eq!(b, a);
      assert_eq!(b, c);
      assert_eq!(a, c);
      assert_eq!(hash_of(&a), hash_of(&b));

      a.principal = None;
      assert_ne!(a, b);
      b.principal = None;
      c.principal = Some(Principal::new("bob"));
      assert_eq!(a, b);
      assert_ne!(b, c);
   }

   #[test]
   fn test_principal_dropped_without_integrated_security() {
      let p = ConnectionParams::parse("Data Source=db1;User ID=sa");
      let key = ListenerKey::new(Some(Principal::new("alice")), &p, None);
      assert!(key.principal().is_none());
      assert!(key.auto_provision());
   }

   #[test]
   fn test_escaping() {
      assert_eq!(escape_identifier("a]b"), "[a]]b]");
      assert_eq!(string_literal("it's"), "N'it''s'");
   }
}
