use uuid::Uuid;

/// Typed value exchanged with a [`BrokerSession`](crate::BrokerSession).
///
/// Used both for command parameters and for the columns of returned rows.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
   Null,
   Bool(bool),
   Integer(i64),
   Text(String),
   Guid(Uuid),
   Xml(String),
}

impl SqlValue {
   /// Returns true if this value is null.
   pub fn is_null(&self) -> bool {
      matches!(self, SqlValue::Null)
   }

   pub fn as_bool(&self) -> Option<bool> {
      match self {
         SqlValue::Bool(b) => Some(*b),
         SqlValue::Integer(i) => Some(*i != 0),
         _ => None,
      }
   }

   pub fn as_integer(&self) -> Option<i64> {
      match self {
         SqlValue::Integer(i) => Some(*i),
         _ => None,
      }
   }

   /// Text content of a text or XML value.
   pub fn as_text(&self) -> Option<&str> {
      match self {
         SqlValue::Text(s) | SqlValue::Xml(s) => Some(s),
         _ => None,
      }
   }

   /// Attempts to get this value as a GUID, parsing text if necessary.
   pub fn as_guid(&self) -> Option<Uuid> {
      match self {
         SqlValue::Guid(g) => Some(*g),
         SqlValue::Text(s) => Uuid::parse_str(s).ok(),
         _ => None,
      }
   }
}

impl From<bool> for SqlValue {
   fn from(value: bool) -> Self {
      SqlValue::Bool(value)
   }
}

impl From<i64> for SqlValue {
   fn from(value: i64) -> Self {
      SqlValue::Integer(value)
   }
}

impl From<Uuid> for SqlValue {
   fn from(value: Uuid) -> Self {
      SqlValue::Guid(value)
   }
}

impl From<&str> for SqlValue {
   fn from(value: &str) -> Self {
      SqlValue::Text(value.to_string())
   }
}

/// Named command parameter, e.g. `("@p2", SqlValue::Integer(0))`.
pub type SqlParam = (&'static str, SqlValue);

/// One result row. Values are ordered by column position in the select list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
   pub fn new(values: Vec<SqlValue>) -> Self {
      Self(values)
   }

   pub fn get(&self, index: usize) -> Option<&SqlValue> {
      self.0.get(index)
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }
}
