use serde::{Serialize, Serializer};

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error response for callers that report errors as data.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// Error types for the notification dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from a listener connection.
   #[error(transparent)]
   Listener(#[from] query_notify_listener::Error),

   /// A subscription with this id is already registered.
   #[error("subscription {0} is already registered")]
   DuplicateRegistration(String),

   /// No subscription with this id is registered.
   #[error("subscription {0} is not registered")]
   UnknownSubscription(String),

   /// A command was enlisted before a listener was started for its target.
   #[error("no listener started for server {server} (queue: {queue})")]
   ListenerNotStarted { server: String, queue: String },

   /// The calling thread is not inside a tokio runtime.
   #[error("no tokio runtime available")]
   RuntimeUnavailable,

   /// The process-wide registry was used before it was initialized, or has
   /// been dropped.
   #[error("notification registry is not available")]
   RegistryUnavailable,
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// Listener errors keep the listener crate's codes.
   pub fn error_code(&self) -> String {
      match self {
         Error::Listener(e) => e.error_code(),
         Error::DuplicateRegistration(_) => "DUPLICATE_REGISTRATION".to_string(),
         Error::UnknownSubscription(_) => "UNKNOWN_SUBSCRIPTION".to_string(),
         Error::ListenerNotStarted { .. } => "LISTENER_NOT_STARTED".to_string(),
         Error::RuntimeUnavailable => "RUNTIME_UNAVAILABLE".to_string(),
         Error::RegistryUnavailable => "REGISTRY_UNAVAILABLE".to_string(),
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
