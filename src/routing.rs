//! Routing keys, query fingerprints, and the registration request attached to
//! a command.
//!
//! A routing key travels to the server inside the notification request and
//! comes back in the payload of the notification. The registry splits it to
//! find the consumer context, and the context's dispatcher uses the suffix to
//! find the registration.

use std::fmt;
use std::time::Duration;

use query_notify_listener::{ConnectionParams, Principal, SqlValue};
use uuid::Uuid;

const DELIMITER: char = ';';

// Fixed namespace so fingerprints are stable across processes.
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_3c2a_8b4e_4d7f_9a51_0c2e_7b3d_91a4);

/// `{context};{suffix}` as sent to the server.
///
/// Context ids are escaped so they never contain the delimiter, which keeps
/// the split on the first `;` unambiguous for any id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
   context_id: String,
   suffix: String,
}

impl RoutingKey {
   pub fn new(context_id: impl Into<String>, suffix: impl Into<String>) -> Self {
      Self {
         context_id: context_id.into(),
         suffix: suffix.into(),
      }
   }

   /// A key with a fresh unique suffix.
   pub fn generate(context_id: &str) -> Self {
      Self::new(context_id, Uuid::new_v4().to_string())
   }

   /// Splits an encoded key on its first delimiter.
   ///
   /// Returns `None` when there is no delimiter or the context part is not a
   /// valid escape sequence.
   pub fn parse(encoded: &str) -> Option<Self> {
      let (context, suffix) = encoded.split_once(DELIMITER)?;
      Some(Self::new(decode_context(context)?, suffix))
   }

   pub fn context_id(&self) -> &str {
      &self.context_id
   }

   pub fn suffix(&self) -> &str {
      &self.suffix
   }
}

impl fmt::Display for RoutingKey {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}{}{}", encode_context(&self.context_id), DELIMITER, self.suffix)
   }
}

fn encode_context(context_id: &str) -> String {
   let mut out = String::with_capacity(context_id.len());
   for c in context_id.chars() {
      match c {
         '%' => out.push_str("%25"),
         DELIMITER => out.push_str("%3B"),
         c => out.push(c),
      }
   }
   out
}

fn decode_context(encoded: &str) -> Option<String> {
   let mut out = String::with_capacity(encoded.len());
   let mut rest = encoded;
   while let Some(pos) = rest.find('%') {
      out.push_str(&rest[..pos]);
      let escape = rest.get(pos..pos + 3)?;
      match escape {
         "%25" => out.push('%'),
         "%3B" | "%3b" => out.push(DELIMITER),
         _ => return None,
      }
      rest = &rest[pos + 3..];
   }
   out.push_str(rest);
   Some(out)
}

/// A named parameter of a tagged command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandParameter {
   pub name: String,
   pub sql_type: String,
   pub value: SqlValue,
}

impl CommandParameter {
   pub fn new(name: impl Into<String>, sql_type: impl Into<String>, value: SqlValue) -> Self {
      Self {
         name: name.into(),
         sql_type: sql_type.into(),
         value,
      }
   }
}

/// Everything that decides whether two commands watch the same query.
#[derive(Debug, Clone)]
pub struct CommandTarget {
   pub params: ConnectionParams,
   pub principal: Option<Principal>,
   /// Queue name, or `None` for the auto-provisioned default.
   pub queue: Option<String>,
   pub command_text: String,
   pub parameters: Vec<CommandParameter>,
}

impl CommandTarget {
   pub fn new(params: ConnectionParams, command_text: impl Into<String>) -> Self {
      Self {
         params,
         principal: None,
         queue: None,
         command_text: command_text.into(),
         parameters: Vec::new(),
      }
   }

   pub fn with_principal(mut self, principal: Principal) -> Self {
      self.principal = Some(principal);
      self
   }

   pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
      self.queue = Some(queue.into());
      self
   }

   pub fn with_parameter(mut self, parameter: CommandParameter) -> Self {
      self.parameters.push(parameter);
      self
   }

   pub fn fingerprint(&self) -> QueryFingerprint {
      QueryFingerprint::compute(self)
   }
}

/// Stable identity of a command's connection target, text, and parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryFingerprint(Uuid);

impl QueryFingerprint {
   pub fn compute(target: &CommandTarget) -> Self {
      let mut input = String::new();
      push_field(&mut input, &target.params.to_connection_string());
      push_field(&mut input, target.principal.as_ref().map_or("", |p| p.name()));
      push_field(&mut input, target.queue.as_deref().unwrap_or(""));
      push_field(&mut input, &target.command_text);
      for p in &target.parameters {
         push_field(&mut input, &p.name);
         push_field(&mut input, &p.sql_type);
         push_field(&mut input, &value_text(&p.value));
      }
      Self(Uuid::new_v5(&FINGERPRINT_NAMESPACE, input.as_bytes()))
   }

   pub fn as_uuid(&self) -> Uuid {
      self.0
   }
}

impl fmt::Display for QueryFingerprint {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      self.0.fmt(f)
   }
}

// Length-prefixed so adjacent fields cannot run into each other.
fn push_field(out: &mut String, field: &str) {
   out.push_str(&field.len().to_string());
   out.push(':');
   out.push_str(field);
}

fn value_text(value: &SqlValue) -> String {
   match value {
      SqlValue::Null => "null".to_string(),
      SqlValue::Bool(b) => format!("bool:{b}"),
      SqlValue::Integer(i) => format!("int:{i}"),
      SqlValue::Text(s) => format!("text:{s}"),
      SqlValue::Guid(g) => format!("guid:{g}"),
      SqlValue::Xml(s) => format!("xml:{s}"),
   }
}

/// Registration request attached to a command before it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
   /// Encoded routing key, returned by the server in the notification.
   pub user_data: String,
   /// Broker service options, `service={queue}` with the database appended
   /// for auto-provisioned queues.
   pub options: String,
   pub timeout_secs: u64,
}

impl NotificationRequest {
   pub fn new(key: &RoutingKey, queue: &str, local_database: Option<&str>, timeout: Duration) -> Self {
      let options = match local_database {
         Some(database) if !database.is_empty() => {
            format!("service={queue};local database={database}")
         }
         _ => format!("service={queue}"),
      };
      Self {
         user_data: key.to_string(),
         options,
         timeout_secs: timeout.as_secs(),
      }
   }
}
