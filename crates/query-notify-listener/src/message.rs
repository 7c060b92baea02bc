//! Query notification payloads.
//!
//! The server delivers each notification as a small XML document:
//!
//! ```text
//! <qn:QueryNotification xmlns:qn="..." id="6" type="change" source="data" info="insert">
//!   <qn:Message>{consumer context id};{suffix}</qn:Message>
//! </qn:QueryNotification>
//! ```
//!
//! [`parse_message`] decodes that shape into a typed [`Notification`]. Attribute
//! values that are present but not recognised decode to the `Unknown` variant;
//! a missing attribute or a missing/empty `Message` element is a
//! [`MalformedPayload`](crate::Error::MalformedPayload).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use crate::{Error, Result};

/// Message type of rows that carry a notification payload.
pub const QUERY_NOTIFICATION_MESSAGE_TYPE: &str =
   "http://schemas.microsoft.com/SQL/Notifications/QueryNotification";

const ROOT_ELEMENT: &str = "QueryNotification";
const MESSAGE_ELEMENT: &str = "Message";

static START_TAG: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^\s*(?:<\?xml[^>]*\?>\s*)?<([A-Za-z_][\w.\-]*(?::[A-Za-z_][\w.\-]*)?)([^>]*)>")
      .expect("start tag pattern is valid")
});

static CHILD_TAG: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^\s*<([A-Za-z_][\w.\-]*(?::[A-Za-z_][\w.\-]*)?)\s*>([^<]*)<")
      .expect("child tag pattern is valid")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r#"([A-Za-z_][\w.\-]*(?::[A-Za-z_][\w.\-]*)?)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
      .expect("attribute pattern is valid")
});

/// Looks up a variant by case-insensitive name or by its numeric value.
fn lookup<T: Copy>(variants: &[(&str, i64, T)], text: &str) -> Option<T> {
   let text = text.trim();
   if let Ok(number) = text.parse::<i64>() {
      return variants
         .iter()
         .find(|(_, value, _)| *value == number)
         .map(|(_, _, variant)| *variant);
   }
   variants
      .iter()
      .find(|(name, _, _)| name.eq_ignore_ascii_case(text))
      .map(|(_, _, variant)| *variant)
}

fn name_of<T: Copy + PartialEq>(variants: &[(&'static str, i64, T)], variant: T) -> &'static str {
   variants
      .iter()
      .find(|(_, _, v)| *v == variant)
      .map(|(name, _, _)| *name)
      .unwrap_or("Unknown")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
   Change,
   Subscribe,
   Unknown,
}

impl NotificationType {
   const VARIANTS: &'static [(&'static str, i64, Self)] = &[
      ("Unknown", -1, Self::Unknown),
      ("Change", 0, Self::Change),
      ("Subscribe", 1, Self::Subscribe),
   ];

   /// Parses a name or numeric value; unrecognised text yields `Unknown`.
   pub fn parse_lenient(text: &str) -> Self {
      lookup(Self::VARIANTS, text).unwrap_or(Self::Unknown)
   }
}

impl fmt::Display for NotificationType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(name_of(Self::VARIANTS, *self))
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationSource {
   Data,
   Timeout,
   Object,
   Database,
   System,
   Statement,
   Environment,
   Execution,
   Owner,
   Client,
   Unknown,
}

impl NotificationSource {
   const VARIANTS: &'static [(&'static str, i64, Self)] = &[
      ("Client", -2, Self::Client),
      ("Unknown", -1, Self::Unknown),
      ("Data", 0, Self::Data),
      ("Timeout", 1, Self::Timeout),
      ("Object", 2, Self::Object),
      ("Database", 3, Self::Database),
      ("System", 4, Self::System),
      ("Statement", 5, Self::Statement),
      ("Environment", 6, Self::Environment),
      ("Execution", 7, Self::Execution),
      ("Owner", 8, Self::Owner),
   ];

   /// Parses a name or numeric value; unrecognised text yields `Unknown`.
   pub fn parse_lenient(text: &str) -> Self {
      lookup(Self::VARIANTS, text).unwrap_or(Self::Unknown)
   }
}

impl fmt::Display for NotificationSource {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(name_of(Self::VARIANTS, *self))
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationInfo {
   Truncate,
   Insert,
   Update,
   Delete,
   Drop,
   Alter,
   Restart,
   Error,
   Query,
   Invalid,
   Options,
   Isolation,
   Expired,
   Resource,
   PreviousFire,
   TemplateLimit,
   Merge,
   AlreadyChanged,
   Unknown,
}

impl NotificationInfo {
   const VARIANTS: &'static [(&'static str, i64, Self)] = &[
      ("AlreadyChanged", -2, Self::AlreadyChanged),
      ("Unknown", -1, Self::Unknown),
      ("Truncate", 1, Self::Truncate),
      ("Insert", 2, Self::Insert),
      ("Update", 3, Self::Update),
      ("Delete", 4, Self::Delete),
      ("Drop", 5, Self::Drop),
      ("Alter", 6, Self::Alter),
      ("Restart", 7, Self::Restart),
      ("Error", 8, Self::Error),
      ("Query", 9, Self::Query),
      ("Invalid", 10, Self::Invalid),
      ("Options", 11, Self::Options),
      ("Isolation", 12, Self::Isolation),
      ("Expired", 13, Self::Expired),
      ("Resource", 14, Self::Resource),
      ("PreviousFire", 15, Self::PreviousFire),
      ("TemplateLimit", 16, Self::TemplateLimit),
      ("Merge", 17, Self::Merge),
   ];

   /// Parses the server's `info` attribute.
   ///
   /// Three server spellings differ from the variant names and are mapped
   /// explicitly; everything else parses by name or number.
   pub fn parse_lenient(text: &str) -> Self {
      match text {
         "set options" => Self::Options,
         "previous invalid" => Self::PreviousFire,
         "query template limit" => Self::TemplateLimit,
         other => lookup(Self::VARIANTS, other).unwrap_or(Self::Unknown),
      }
   }
}

impl fmt::Display for NotificationInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(name_of(Self::VARIANTS, *self))
   }
}

/// A decoded invalidation event.
///
/// `routing_key` is `None` for notifications synthesised on the client
/// (timeouts, server failures) rather than received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
   pub kind: NotificationType,
   pub source: NotificationSource,
   pub info: NotificationInfo,
   pub routing_key: Option<String>,
}

impl Notification {
   pub fn new(
      kind: NotificationType,
      source: NotificationSource,
      info: NotificationInfo,
      routing_key: Option<String>,
   ) -> Self {
      Self {
         kind,
         source,
         info,
         routing_key,
      }
   }

   /// Raised when a subscription outlives its expiration.
   pub fn timeout() -> Self {
      Self::new(
         NotificationType::Change,
         NotificationSource::Timeout,
         NotificationInfo::Error,
         None,
      )
   }

   /// Raised for every subscription bound to a server whose listener failed.
   pub fn server_failure() -> Self {
      Self::new(
         NotificationType::Change,
         NotificationSource::Client,
         NotificationInfo::Error,
         None,
      )
   }
}

fn local_name(qualified: &str) -> &str {
   qualified.rsplit(':').next().unwrap_or(qualified)
}

/// Decodes the five predefined XML entities and numeric character references.
fn decode_entities(text: &str) -> Result<String> {
   if !text.contains('&') {
      return Ok(text.to_string());
   }

   let mut out = String::with_capacity(text.len());
   let mut rest = text;
   while let Some(start) = rest.find('&') {
      out.push_str(&rest[..start]);
      let tail = &rest[start + 1..];
      let end = tail
         .find(';')
         .ok_or_else(|| Error::MalformedPayload("unterminated entity reference".into()))?;
      let entity = &tail[..end];
      let decoded = match entity {
         "lt" => '<',
         "gt" => '>',
         "amp" => '&',
         "quot" => '"',
         "apos" => '\'',
         _ => {
            let code = if let Some(hex) = entity.strip_prefix("#x") {
               u32::from_str_radix(hex, 16).ok()
            } else if let Some(dec) = entity.strip_prefix('#') {
               dec.parse::<u32>().ok()
            } else {
               None
            }
            .and_then(char::from_u32);
            code.ok_or_else(|| Error::MalformedPayload(format!("unknown entity &{};", entity)))?
         }
      };
      out.push(decoded);
      rest = &tail[end + 1..];
   }
   out.push_str(rest);
   Ok(out)
}

/// Decodes a notification payload.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] when the root element is not
/// `QueryNotification`, when any of the `type`, `source` or `info`
/// attributes is missing, or when the `Message` child is absent or empty.
pub fn parse_message(payload: &str) -> Result<Notification> {
   let malformed = |reason: &str| Error::MalformedPayload(reason.to_string());

   let root = START_TAG
      .captures(payload)
      .ok_or_else(|| malformed("payload does not start with an element"))?;
   let root_name = root.get(1).map_or("", |m| m.as_str());
   if local_name(root_name) != ROOT_ELEMENT {
      return Err(malformed("unexpected root element"));
   }

   let attribute_text = root.get(2).map_or("", |m| m.as_str());
   if attribute_text.trim_end().ends_with('/') {
      return Err(malformed("root element has no content"));
   }

   let attributes: Vec<(&str, &str)> = ATTRIBUTE
      .captures_iter(attribute_text)
      .filter_map(|c| {
         let name = c.get(1)?.as_str();
         let value = c.get(2).or_else(|| c.get(3))?.as_str();
         Some((name, value))
      })
      .collect();
   if attributes.len() < 3 {
      return Err(malformed("root element carries fewer than three attributes"));
   }

   let mut kind = None;
   let mut source = None;
   let mut info = None;
   for (name, raw) in attributes {
      match local_name(name) {
         "type" => kind = Some(NotificationType::parse_lenient(&decode_entities(raw)?)),
         "source" => source = Some(NotificationSource::parse_lenient(&decode_entities(raw)?)),
         "info" => info = Some(NotificationInfo::parse_lenient(&decode_entities(raw)?)),
         _ => {}
      }
   }
   let (Some(kind), Some(source), Some(info)) = (kind, source, info) else {
      return Err(malformed("not all of type, source and info are present"));
   };

   let body = &payload[root.get(0).map_or(0, |m| m.end())..];
   let child = CHILD_TAG
      .captures(body)
      .ok_or_else(|| malformed("missing Message element"))?;
   let child_name = child.get(1).map_or("", |m| m.as_str());
   if !local_name(child_name).eq_ignore_ascii_case(MESSAGE_ELEMENT) {
      return Err(malformed("unexpected child element"));
   }

   let text = child.get(2).map_or("", |m| m.as_str());
   if text.trim().is_empty() {
      return Err(malformed("Message element has no text"));
   }

   // The message text is itself an escaped fragment; it must resolve to plain text.
   let once = decode_entities(text)?;
   if once.contains('<') {
      return Err(malformed("Message element does not contain text"));
   }
   let key = decode_entities(&once)?;

   trace!(%kind, %source, %info, key = %key, "Parsed notification payload");

   Ok(Notification::new(kind, source, info, Some(key)))
}

/// Builds a payload in the server's format. Used by the in-memory broker.
pub fn render_message(
   kind: NotificationType,
   source: NotificationSource,
   info: &str,
   routing_key: &str,
) -> String {
   fn escape(text: &str) -> String {
      text
         .replace('&', "&amp;")
         .replace('<', "&lt;")
         .replace('>', "&gt;")
         .replace('"', "&quot;")
   }

   format!(
      "<qn:QueryNotification xmlns:qn=\"{ns}\" id=\"1\" type=\"{kind}\" source=\"{source}\" info=\"{info}\" database_id=\"5\">\
       <qn:Message>{key}</qn:Message></qn:QueryNotification>",
      ns = QUERY_NOTIFICATION_MESSAGE_TYPE,
      kind = kind.to_string().to_lowercase(),
      source = source.to_string().to_lowercase(),
      info = escape(info),
      key = escape(&escape(routing_key)),
   )
}
