//! Live Message Types
//!
//! JSON messages pushed to web peers. Every message carries a `msgType` tag.

use crate::record::{DeviceId, GpsRecord};
use serde::Serialize;

/// Messages sent from server to web peers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msgType", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First message on every peer: the devices currently connected
    Setup {
        /// Sorted device ids
        devices: Vec<DeviceId>,
    },
    /// A location update, flattened to the record's own keys
    Update(GpsRecord),
    /// A device identified itself
    Connected { id: DeviceId },
    /// An identified device went away
    Disconnected { id: DeviceId },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    #[test]
    fn test_setup_shape() {
        let msg = ServerMessage::Setup {
            devices: vec![id("a"), id("b")],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"msgType": "setup", "devices": ["a", "b"]}));
    }

    #[test]
    fn test_update_is_flattened() {
        let record = GpsRecord::new(
            Some(id("dev")),
            "10.0.0.9:1234".parse().unwrap(),
            1000,
            49.2,
            -123.1,
            10.0,
            0.5,
        );
        let value: Value =
            serde_json::from_str(&ServerMessage::Update(record).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "msgType": "update",
                "id": "dev",
                "ip": "10.0.0.9:1234",
                "timestamp": 1000,
                "lat": 49.2,
                "lon": -123.1,
                "altitude": 10.0,
                "speed": 0.5
            })
        );
    }

    #[test]
    fn test_presence_messages() {
        let connected = ServerMessage::Connected { id: id("x") }.to_json().unwrap();
        let disconnected = ServerMessage::Disconnected { id: id("x") }.to_json().unwrap();
        assert_eq!(connected, r#"{"msgType":"connected","id":"x"}"#);
        assert_eq!(disconnected, r#"{"msgType":"disconnected","id":"x"}"#);
    }
}
