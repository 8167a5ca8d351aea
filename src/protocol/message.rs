//! Protocol message definitions
//!
//! A message is a correlation id plus an ordered map of operation ids to
//! CBOR values. Requests and responses share this shape; the correlation id
//! travels as the reserved [`function::REQUEST_ID`] entry of the same map.

use ciborium::value::{Integer, Value};
use std::fmt;
use thiserror::Error;

use super::function;

/// Message (CBOR) errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("CBOR decode error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("CBOR encode error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Payload is not a map")]
    NotAMap,

    #[error("Invalid map key: {0:?}")]
    InvalidKey(Value),

    #[error("Missing correlation id")]
    MissingCorrelationId,

    #[error("Invalid correlation id: {0:?}")]
    InvalidCorrelationId(Value),

    #[error("Operation id {0} is reserved for the correlation id")]
    ReservedKey(OperationId),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Identifies an operation (a key of the message map)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u8);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for OperationId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Tag shared by a request and its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u8);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Insertion-ordered map of operation ids to values.
///
/// Messages carry a handful of entries, so lookups scan linearly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationMap {
    entries: Vec<(OperationId, Value)>,
}

impl OperationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, keeping the position of an existing key
    pub fn insert(&mut self, id: OperationId, value: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(key, _)| *key == id) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((id, value));
                None
            }
        }
    }

    /// Builder-style insert
    pub fn with(mut self, id: OperationId, value: Value) -> Self {
        self.insert(id, value);
        self
    }

    pub fn get(&self, id: OperationId) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| *key == id)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, id: OperationId) -> Option<Value> {
        let pos = self.entries.iter().position(|(key, _)| *key == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, id: OperationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.entries.iter().map(|(key, _)| *key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperationId, &Value)> {
        self.entries.iter().map(|(key, value)| (*key, value))
    }
}

impl FromIterator<(OperationId, Value)> for OperationMap {
    fn from_iter<T: IntoIterator<Item = (OperationId, Value)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (id, value) in iter {
            map.insert(id, value);
        }
        map
    }
}

impl IntoIterator for OperationMap {
    type Item = (OperationId, Value);
    type IntoIter = std::vec::IntoIter<(OperationId, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A logical message exchanged with the device
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub correlation_id: CorrelationId,
    pub operations: OperationMap,
}

/// Outbound message
pub type Request = Message;

/// Inbound message
pub type Response = Message;

impl Message {
    /// Create a message, rejecting operation maps that use the reserved key
    pub fn new(correlation_id: CorrelationId, operations: OperationMap) -> MessageResult<Self> {
        Self::check_operations(&operations)?;
        Ok(Self {
            correlation_id,
            operations,
        })
    }

    /// Fail if `operations` uses the reserved correlation key
    pub fn check_operations(operations: &OperationMap) -> MessageResult<()> {
        if operations.contains(function::REQUEST_ID) {
            return Err(MessageError::ReservedKey(function::REQUEST_ID));
        }
        Ok(())
    }

    /// Serialize into a CBOR map. The correlation id is written last.
    pub fn encode(&self) -> MessageResult<Vec<u8>> {
        Self::check_operations(&self.operations)?;

        let mut entries: Vec<(Value, Value)> = self
            .operations
            .iter()
            .map(|(id, value)| (Value::Integer(Integer::from(id.0)), value.clone()))
            .collect();
        entries.push((
            Value::Integer(Integer::from(function::REQUEST_ID.0)),
            Value::Integer(Integer::from(self.correlation_id.0)),
        ));

        let mut payload = Vec::with_capacity(8 + 4 * entries.len());
        ciborium::ser::into_writer(&Value::Map(entries), &mut payload)?;
        Ok(payload)
    }

    /// Deserialize a CBOR map, splitting off the correlation id
    pub fn decode(payload: &[u8]) -> MessageResult<Self> {
        let value: Value = ciborium::de::from_reader(payload)?;
        let Value::Map(entries) = value else {
            return Err(MessageError::NotAMap);
        };

        let mut correlation_id = None;
        let mut operations = OperationMap::new();
        for (key, value) in entries {
            let id = match &key {
                Value::Integer(int) => u8::try_from(*int).map(OperationId).ok(),
                _ => None,
            }
            .ok_or(MessageError::InvalidKey(key))?;

            if id == function::REQUEST_ID {
                let tag = match &value {
                    Value::Integer(int) => u8::try_from(*int).map(CorrelationId).ok(),
                    _ => None,
                };
                correlation_id = Some(tag.ok_or(MessageError::InvalidCorrelationId(value))?);
            } else {
                operations.insert(id, value);
            }
        }

        Ok(Self {
            correlation_id: correlation_id.ok_or(MessageError::MissingCorrelationId)?,
            operations,
        })
    }
}
