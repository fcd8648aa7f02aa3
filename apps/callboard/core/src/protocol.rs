use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Confirmation text sent as the first frame of every session.
pub const CONNECTED_MESSAGE: &str = "connected";

/// Unit published to a broadcast group by the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastEvent {
    DataUpdate { payload: Snapshot },
}

impl BroadcastEvent {
    pub fn data_update(payload: Snapshot) -> Self {
        BroadcastEvent::DataUpdate { payload }
    }

    pub fn payload(&self) -> &Snapshot {
        match self {
            BroadcastEvent::DataUpdate { payload } => payload,
        }
    }
}

/// Frames sent from the server to a browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected { message: String },
    DataUpdate { payload: Snapshot },
    Heartbeat,
    Pong,
}

impl ServerMessage {
    pub fn connected() -> Self {
        ServerMessage::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::DataUpdate { .. } => "data_update",
            ServerMessage::Heartbeat => "heartbeat",
            ServerMessage::Pong => "pong",
        }
    }
}

impl From<BroadcastEvent> for ServerMessage {
    fn from(event: BroadcastEvent) -> Self {
        match event {
            BroadcastEvent::DataUpdate { payload } => ServerMessage::DataUpdate { payload },
        }
    }
}

/// Frames a browser session may send. Anything with an unrecognised `type`
/// decodes as `Unknown`; frames without a `type` fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Ping,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalize_dataset, Dataset};
    use serde_json::json;

    #[test_timeout::timeout]
    fn server_frames_match_the_browser_protocol() {
        assert_eq!(
            serde_json::to_value(ServerMessage::Heartbeat).unwrap(),
            json!({"type": "heartbeat"})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Pong).unwrap(),
            json!({"type": "pong"})
        );
        let connected = serde_json::to_value(ServerMessage::connected()).unwrap();
        assert_eq!(connected["message"], json!("connected"));
    }

    #[test_timeout::timeout]
    fn broadcast_event_forwards_as_data_update() {
        let calls = normalize_dataset(Dataset::CallsOnHold, json!([{"id": 1}])).unwrap();
        let event = BroadcastEvent::data_update(Snapshot::new(calls, Vec::new()));
        let expected = json!({
            "type": "dataUpdate",
            "payload": {"getCallsOnHoldData": [{"id": 1}], "getLiveQueueStatusData": []}
        });
        assert_eq!(serde_json::to_value(&event).unwrap(), expected);

        let frame = ServerMessage::from(event.clone());
        assert_eq!(serde_json::to_value(&frame).unwrap(), expected);

        let decoded: BroadcastEvent = serde_json::from_value(expected).unwrap();
        assert_eq!(decoded, event);
    }

    #[test_timeout::timeout]
    fn client_frames_decode() {
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe","group":"x"}"#)
                .unwrap(),
            ClientMessage::Unknown
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"kind":"ping"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("ping").is_err());
    }
}
