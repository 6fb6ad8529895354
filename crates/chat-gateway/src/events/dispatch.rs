//! Dispatch events delivered to the application

use super::EventKind;
use serde_json::Value;

/// A decoded op 0 frame, tagged with the shard it came from
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub shard_id: u32,
    pub sequence: u64,
    /// Raw event name as sent by the server
    pub name: String,
    /// `None` for names outside the known set
    pub kind: Option<EventKind>,
    pub data: Value,
}

impl DispatchEvent {
    #[must_use]
    pub fn new(shard_id: u32, sequence: u64, name: impl Into<String>, data: Value) -> Self {
        let name = name.into();
        Self {
            shard_id,
            sequence,
            kind: EventKind::from_name(&name),
            name,
            data,
        }
    }

    /// Decode the event data into a concrete payload type
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}
