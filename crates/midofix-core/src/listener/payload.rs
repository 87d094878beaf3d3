// # Event Payload Traits
//
// Ceilometer event notifications carry a list of events. Each event has an
// `event_type` and a `traits` list of `[name, type, value]` triples:
//
// ```json
// [
//   {
//     "event_type": "port.create.end",
//     "traits": [
//       ["resource_id", 1, "2c4b5a4e-..."],
//       ["tenant_id", 1, "0a1b..."]
//     ]
//   }
// ]
// ```
//
// Only the first event is interpreted.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Name of the trait holding the id of the resource the event is about
pub const RESOURCE_ID_TRAIT: &str = "resource_id";

/// Traits of the first event in a notification payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTraits {
    event_type: Option<String>,
    values: HashMap<String, String>,
}

impl EventTraits {
    /// Collapse the traits triples of a payload into a name→value mapping
    ///
    /// Non-string values are kept in their JSON rendering.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let event = payload
            .as_array()
            .and_then(|events| events.first())
            .ok_or_else(|| Error::payload("expected a non-empty list of events"))?;

        let triples = event
            .get("traits")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::payload("event has no traits list"))?;

        let mut values = HashMap::with_capacity(triples.len());
        for triple in triples {
            let fields = triple
                .as_array()
                .filter(|fields| fields.len() >= 3)
                .ok_or_else(|| Error::payload(format!("malformed trait: {}", triple)))?;

            let name = fields[0]
                .as_str()
                .ok_or_else(|| Error::payload(format!("trait name is not a string: {}", triple)))?;

            let value = match &fields[2] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.insert(name.to_string(), value);
        }

        Ok(Self {
            event_type: event
                .get("event_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            values,
        })
    }

    /// Event type declared inside the payload, if any
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// Value of a trait
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// The `resource_id` trait, which must be present and non-empty
    pub fn resource_id(&self) -> Result<&str> {
        self.get(RESOURCE_ID_TRAIT)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::payload("missing resource_id trait"))
    }

    /// Number of traits
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the event carried no traits
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
