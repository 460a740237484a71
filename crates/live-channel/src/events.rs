use catalog_sdk::ItemId;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::ChannelError;

/// A named message as it arrives off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: String,
    pub data: String,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
    CatalogChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Progress,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::CatalogChanged,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::CatalogChanged => "catalogChanged",
        }
    }

    pub fn from_wire(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.wire_name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Progress {
        item_id: ItemId,
        percent: f32,
        speed: Option<f64>,
    },
    Completed {
        item_id: ItemId,
    },
    Failed {
        item_id: ItemId,
        error: String,
    },
    CatalogChanged,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressPayload {
    item_id: ItemId,
    percent: f32,
    #[serde(default)]
    speed: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletedPayload {
    item_id: ItemId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedPayload {
    item_id: ItemId,
    #[serde(default)]
    error: Option<String>,
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LiveEvent::Progress { .. } => EventKind::Progress,
            LiveEvent::Completed { .. } => EventKind::Completed,
            LiveEvent::Failed { .. } => EventKind::Failed,
            LiveEvent::CatalogChanged => EventKind::CatalogChanged,
        }
    }

    pub fn item_id(&self) -> Option<&ItemId> {
        match self {
            LiveEvent::Progress { item_id, .. }
            | LiveEvent::Completed { item_id }
            | LiveEvent::Failed { item_id, .. } => Some(item_id),
            LiveEvent::CatalogChanged => None,
        }
    }

    /// Decodes a raw message. Unknown event names yield `Ok(None)`; a known name
    /// with a payload that does not parse is a protocol error.
    pub fn decode(raw: &RawEvent) -> Result<Option<LiveEvent>, ChannelError> {
        let Some(kind) = EventKind::from_wire(&raw.event) else {
            return Ok(None);
        };
        let event = match kind {
            EventKind::Progress => {
                let payload: ProgressPayload = parse(raw)?;
                if !payload.percent.is_finite() || !(0.0..=100.0).contains(&payload.percent) {
                    return Err(protocol(raw, format!("percent {} out of range", payload.percent)));
                }
                LiveEvent::Progress {
                    item_id: payload.item_id,
                    percent: payload.percent,
                    speed: payload.speed,
                }
            }
            EventKind::Completed => {
                let payload: CompletedPayload = parse(raw)?;
                LiveEvent::Completed {
                    item_id: payload.item_id,
                }
            }
            EventKind::Failed => {
                let payload: FailedPayload = parse(raw)?;
                LiveEvent::Failed {
                    item_id: payload.item_id,
                    error: payload.error.unwrap_or_else(|| "unknown error".into()),
                }
            }
            EventKind::CatalogChanged => LiveEvent::CatalogChanged,
        };
        Ok(Some(event))
    }
}

fn parse<T: DeserializeOwned>(raw: &RawEvent) -> Result<T, ChannelError> {
    serde_json::from_str(&raw.data).map_err(|err| protocol(raw, err.to_string()))
}

fn protocol(raw: &RawEvent, reason: String) -> ChannelError {
    ChannelError::Protocol {
        event: raw.event.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_progress() {
        let raw = RawEvent::new("progress", r#"{"itemId":"x","percent":42,"speed":1024.5}"#);
        let event = LiveEvent::decode(&raw).unwrap().unwrap();
        assert_eq!(
            event,
            LiveEvent::Progress {
                item_id: ItemId::from("x"),
                percent: 42.0,
                speed: Some(1024.5),
            }
        );
        assert_eq!(event.kind(), EventKind::Progress);
    }

    #[test]
    fn catalog_changed_ignores_payload() {
        let event = LiveEvent::decode(&RawEvent::new("catalogChanged", "")).unwrap();
        assert_eq!(event, Some(LiveEvent::CatalogChanged));
    }

    #[test]
    fn failed_defaults_error_text() {
        let raw = RawEvent::new("failed", r#"{"itemId":"y"}"#);
        match LiveEvent::decode(&raw).unwrap() {
            Some(LiveEvent::Failed { item_id, error }) => {
                assert_eq!(item_id.as_str(), "y");
                assert_eq!(error, "unknown error");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_names_are_ignored() {
        assert_eq!(LiveEvent::decode(&RawEvent::new("message", "{}")).unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let err = LiveEvent::decode(&RawEvent::new("completed", "{not json")).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol { ref event, .. } if event == "completed"));

        let err =
            LiveEvent::decode(&RawEvent::new("progress", r#"{"itemId":"x","percent":140}"#))
                .unwrap_err();
        assert!(matches!(err, ChannelError::Protocol { .. }));
    }

    #[test]
    fn wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
        }
    }
}
