//! Error types for the query-notify-listener crate.

use std::fmt;

/// Classifies a failure reported by a [`BrokerSession`] or [`Connector`].
///
/// [`BrokerSession`]: crate::BrokerSession
/// [`Connector`]: crate::Connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
   /// The physical connection could not be opened or was lost.
   Connection,
   /// The server rejected or failed a command.
   Server,
   /// A process-fatal failure (allocation failure, runtime shutdown). Never retried.
   Fatal,
}

impl fmt::Display for SessionErrorKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(match self {
         SessionErrorKind::Connection => "connection",
         SessionErrorKind::Server => "server",
         SessionErrorKind::Fatal => "fatal",
      })
   }
}

/// Failure reported by a collaborator session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct SessionError {
   pub kind: SessionErrorKind,
   pub message: String,
}

impl SessionError {
   pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
      Self {
         kind,
         message: message.into(),
      }
   }

   pub fn connection(message: impl Into<String>) -> Self {
      Self::new(SessionErrorKind::Connection, message)
   }

   pub fn server(message: impl Into<String>) -> Self {
      Self::new(SessionErrorKind::Server, message)
   }

   pub fn fatal(message: impl Into<String>) -> Self {
      Self::new(SessionErrorKind::Fatal, message)
   }

   pub fn is_fatal(&self) -> bool {
      self.kind == SessionErrorKind::Fatal
   }
}

/// Errors that can occur while running a listener connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the underlying session.
   #[error(transparent)]
   Session(#[from] SessionError),

   /// The listener could not be brought up. Partial server state has been unwound.
   #[error("listener setup failed for queue {queue}: {source}")]
   SetupFailed {
      queue: String,
      #[source]
      source: Box<Error>,
   },

   /// The target database does not have the message broker enabled.
   #[error("message broker is not enabled on database {database}")]
   BrokerDisabled { database: String },

   /// A notification payload could not be decoded.
   #[error("malformed notification payload: {0}")]
   MalformedPayload(String),

   /// A failure that must not be swallowed or retried.
   #[error("unrecoverable listener failure: {0}")]
   Unrecoverable(String),

   /// The listener is stopping or stopped and no longer accepts references.
   #[error("listener has been stopped")]
   Stopped,
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Session(e) => match e.kind {
            SessionErrorKind::Connection => "SESSION_CONNECTION_ERROR".to_string(),
            SessionErrorKind::Server => "SESSION_SERVER_ERROR".to_string(),
            SessionErrorKind::Fatal => "SESSION_FATAL_ERROR".to_string(),
         },
         Error::SetupFailed { .. } => "SETUP_FAILED".to_string(),
         Error::BrokerDisabled { .. } => "BROKER_DISABLED".to_string(),
         Error::MalformedPayload(_) => "MALFORMED_PAYLOAD".to_string(),
         Error::Unrecoverable(_) => "UNRECOVERABLE".to_string(),
         Error::Stopped => "LISTENER_STOPPED".to_string(),
      }
   }

   /// Returns false for failures that must propagate instead of entering recovery.
   pub fn is_recoverable(&self) -> bool {
      match self {
         Error::Unrecoverable(_) => false,
         Error::Session(e) => !e.is_fatal(),
         Error::SetupFailed { source, .. } => source.is_recoverable(),
         _ => true,
      }
   }

   pub(crate) fn setup_failed(queue: &str, source: Error) -> Self {
      // Fatal failures keep their identity so callers can tell them apart.
      if !source.is_recoverable() {
         return source;
      }
      Error::SetupFailed {
         queue: queue.to_string(),
         source: Box::new(source),
      }
   }
}
