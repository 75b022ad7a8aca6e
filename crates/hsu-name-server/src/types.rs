//! Data types for the name server.
//!
//! # Rust Learning Note
//!
//! These types lean on the type system instead of loose strings:
//! - `serde` derives give JSON encoding for free
//! - `chrono` gives a type-safe UTC timestamp
//! - `EventType` is an enum, so a misspelled event kind is a compile error

use chrono::{DateTime, Utc};
use hsu_common::ServiceName;
use serde::{Deserialize, Serialize};

/// A named service's network locator, as held in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique registry key.
    pub name: ServiceName,

    /// Opaque transport locator (e.g. "tcp://10.0.0.1:9000").
    pub address: String,

    /// When this entry was (re-)registered.
    pub registered_at: DateTime<Utc>,
}

impl Endpoint {
    /// Creates a new endpoint stamped with the current time.
    pub fn new(name: ServiceName, address: impl Into<String>) -> Self {
        Self {
            name,
            address: address.into(),
            registered_at: Utc::now(),
        }
    }
}

/// Kind of registry change carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Registered,
    Unregistered,
}

/// Registry-change notification sent on the publish channel.
///
/// Wire form: `{"event":"registered","name":"svc-a","address":"tcp://..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub event_type: EventType,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Event {
    /// Event for a successful registration.
    pub fn registered(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Registered,
            name: name.into(),
            address: Some(address.into()),
        }
    }

    /// Event for a successful removal.
    pub fn unregistered(name: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Unregistered,
            name: name.into(),
            address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_creation() {
        let before = Utc::now();
        let endpoint = Endpoint::new(ServiceName::from("svc-a"), "tcp://10.0.0.1:9000");

        assert_eq!(endpoint.name.as_str(), "svc-a");
        assert_eq!(endpoint.address, "tcp://10.0.0.1:9000");
        assert!(endpoint.registered_at >= before);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(Event::registered("svc-a", "tcp://10.0.0.1:9000")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "registered", "name": "svc-a", "address": "tcp://10.0.0.1:9000"})
        );

        // No address key at all for removals
        let json = serde_json::to_string(&Event::unregistered("svc-a")).unwrap();
        assert_eq!(json, r#"{"event":"unregistered","name":"svc-a"}"#);
    }
}
