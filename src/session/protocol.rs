//! Device wire protocol
//!
//! Devices send one JSON object per frame. An object carrying an `id` key is
//! metadata that names the device; anything else is a location update:
//!
//! ```json
//! {"id": "AA:BB:CC"}
//! {"timestamp": 1000, "lat": 49.2, "lon": -123.1, "altitude": 10.0, "speed": 0.0}
//! ```

use crate::record::DeviceId;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const KEY_ID: &str = "id";

/// A parsed device message
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Establishes the session's device identity
    Metadata { device_id: DeviceId },
    /// A location sample
    Update(UpdatePayload),
}

/// Fields of a location update
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct UpdatePayload {
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub speed: f64,
}

/// Why a device message was rejected
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed message: expected a JSON object")]
    NotAnObject,

    #[error("Malformed message: `id` must be a non-empty string")]
    InvalidDeviceId,
}

impl DeviceMessage {
    /// Parse one frame of device text
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match fields.remove(KEY_ID) {
            Some(Value::String(id)) => DeviceId::new(id)
                .map(|device_id| DeviceMessage::Metadata { device_id })
                .ok_or(ProtocolError::InvalidDeviceId),
            Some(_) => Err(ProtocolError::InvalidDeviceId),
            None => {
                let payload = serde_json::from_value(Value::Object(fields))?;
                Ok(DeviceMessage::Update(payload))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        let msg = DeviceMessage::parse(r#"{"id":"AA:BB:CC"}"#).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::Metadata {
                device_id: DeviceId::new("AA:BB:CC").unwrap()
            }
        );
    }

    #[test]
    fn test_parse_update() {
        let msg = DeviceMessage::parse(
            r#"{"timestamp":1000,"lat":49.2,"lon":-123.1,"altitude":10.0,"speed":0.0}"#,
        )
        .unwrap();
        match msg {
            DeviceMessage::Update(p) => {
                assert_eq!(p.timestamp, 1000);
                assert_eq!(p.lat, 49.2);
                assert_eq!(p.lon, -123.1);
                assert_eq!(p.altitude, 10.0);
                assert_eq!(p.speed, 0.0);
            }
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_integer_coordinates_accepted() {
        let msg =
            DeviceMessage::parse(r#"{"timestamp":5,"lat":49,"lon":-123,"altitude":0,"speed":3}"#)
                .unwrap();
        assert!(matches!(msg, DeviceMessage::Update(p) if p.lat == 49.0 && p.speed == 3.0));
    }

    #[test]
    fn test_missing_field_is_reported() {
        let err = DeviceMessage::parse(r#"{"timestamp":1000,"lat":49.2}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
        assert!(err.to_string().contains("lon"));
    }

    #[test]
    fn test_rejects_non_objects_and_bad_ids() {
        assert!(matches!(
            DeviceMessage::parse("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            DeviceMessage::parse(r#"{"id":""}"#),
            Err(ProtocolError::InvalidDeviceId)
        ));
        assert!(matches!(
            DeviceMessage::parse(r#"{"id":42}"#),
            Err(ProtocolError::InvalidDeviceId)
        ));
        assert!(matches!(
            DeviceMessage::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
