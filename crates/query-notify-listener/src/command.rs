//! The listener's receive batch.
//!
//! A listener keeps exactly one command in flight. Ending the previous
//! conversation is folded into the next receive so each message costs one
//! round trip.

use std::time::Duration;

use uuid::Uuid;

use crate::key::escape_identifier;
use crate::value::{SqlParam, SqlValue};

pub(crate) const END_CONVERSATION_SQL: &str = "END CONVERSATION @p1; ";

#[derive(Debug, Clone)]
pub struct ReceiveCommand {
   receive_sql: String,
   begin_conversation_sql: Option<String>,
   pending_handle: Option<Uuid>,
   timeout: Duration,
}

impl ReceiveCommand {
   /// Creates a receive for `queue` with a zero timeout.
   pub fn new(queue: &str) -> Self {
      Self {
         receive_sql: format!(
            "WAITFOR(RECEIVE TOP (1) message_type_name, conversation_handle, cast(message_body AS XML) as message_body from {}), TIMEOUT @p2;",
            escape_identifier(queue)
         ),
         begin_conversation_sql: None,
         pending_handle: None,
         timeout: Duration::ZERO,
      }
   }

   /// Re-arms the dialog timer of `dialog` on every batch.
   pub fn arm_conversation_timer(&mut self, dialog: Uuid, timeout_secs: u64) {
      self.begin_conversation_sql = Some(format!(
         "BEGIN CONVERSATION TIMER ('{}') TIMEOUT = {}; ",
         dialog, timeout_secs
      ));
   }

   pub fn set_timeout(&mut self, timeout: Duration) {
      self.timeout = timeout;
   }

   pub fn timeout(&self) -> Duration {
      self.timeout
   }

   /// Records the conversation to end with the next batch. `None` clears it.
   pub fn set_pending_handle(&mut self, handle: Option<Uuid>) {
      self.pending_handle = handle;
   }

   pub fn pending_handle(&self) -> Option<Uuid> {
      self.pending_handle
   }

   /// Forgets any pending conversation. Called after a failed batch.
   pub fn reset(&mut self) {
      self.pending_handle = None;
   }

   /// SQL and parameters for the next round trip.
   pub fn batch(&self) -> (String, Vec<SqlParam>) {
      let body = match &self.begin_conversation_sql {
         Some(begin) => format!("{}{}", begin, self.receive_sql),
         None => self.receive_sql.clone(),
      };
      let timeout = SqlValue::Integer(self.timeout.as_millis() as i64);

      match self.pending_handle {
         Some(handle) => (
            format!("{}{}", END_CONVERSATION_SQL, body),
            vec![("@p2", timeout), ("@p1", SqlValue::Guid(handle))],
         ),
         None => (body, vec![("@p2", timeout)]),
      }
   }
}
