//! Event types emitted by source repositories and consumed by subscribers.
//!
//! [`Event`] is the legacy wire shape; [`EnhancedEvent`] additionally
//! carries delivery metadata (id, correlation, trace, headers). Conversion
//! between the two is lossless for the five shared fields.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event (legacy shape)
// ---------------------------------------------------------------------------

/// A typed event emitted by a source repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `build_completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Optional semantic version of the payload schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Arbitrarily nested payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Repository that emitted the event (`owner/repo`).
    pub source: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        schema_version: Option<String>,
        payload: Map<String, Value>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EnhancedEvent
// ---------------------------------------------------------------------------

/// Delivery metadata attached to an [`EnhancedEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique delivery id.
    pub id: String,
    /// Correlation id linking related deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    /// Trace id for distributed tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Transport headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// An [`Event`] enriched with delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: EventMetadata,
}

impl EnhancedEvent {
    /// Wrap a legacy event, stamping a fresh delivery id.
    pub fn from_legacy(event: Event) -> Self {
        Self {
            event_type: event.event_type,
            schema_version: event.schema_version,
            payload: event.payload,
            source: event.source,
            timestamp: event.timestamp,
            metadata: EventMetadata {
                id: Uuid::new_v4().to_string(),
                correlation: None,
                trace: None,
                headers: HashMap::new(),
            },
        }
    }

    /// Strip delivery metadata, recovering the legacy shape.
    pub fn into_legacy(self) -> Event {
        Event {
            event_type: self.event_type,
            schema_version: self.schema_version,
            payload: self.payload,
            source: self.source,
            timestamp: self.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
