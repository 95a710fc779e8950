//! JSON control-channel messages (spec.md §4.1, §6).
//!
//! A text frame is a JSON array of `{"method": ..., "params": ...}` objects.
//! A client may batch several in one frame; the server decodes each entry
//! independently so one malformed entry never drops its siblings (spec.md
//! §4.7: unknown method / malformed params are logged and dropped, the
//! connection stays open).

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::warn;

pub type Properties = Map<String, serde_json::Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct PublishParams {
    pub name: String,
    #[serde(rename = "type")]
    pub type_str: String,
    pub pubuid: i64,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnpublishParams {
    pub pubuid: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeParams {
    pub subuid: i64,
    pub topics: Vec<String>,
    #[serde(default)]
    pub options: SubscriptionOptionsWire,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptionsWire {
    pub prefix: bool,
    pub all: bool,
    pub topicsonly: bool,
    pub periodic: f64,
}

impl Default for SubscriptionOptionsWire {
    fn default() -> Self {
        Self {
            prefix: false,
            all: false,
            topicsonly: false,
            periodic: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeParams {
    pub subuid: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPropertiesParams {
    pub name: String,
    pub update: Properties,
}

/// A single decoded inbound control message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ClientControlMessage {
    Publish(PublishParams),
    Unpublish(UnpublishParams),
    Subscribe(SubscribeParams),
    Unsubscribe(UnsubscribeParams),
    Setproperties(SetPropertiesParams),
}

/// Decode a text frame into zero or more control messages. Entries that
/// fail to parse (unknown method, mistyped params) are logged and skipped
/// rather than failing the whole batch.
pub fn decode_control_batch(text: &str) -> Vec<ClientControlMessage> {
    let raw: Vec<serde_json::Value> = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping malformed control frame (not a JSON array)");
            return Vec::new();
        }
    };

    raw.into_iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(error = %e, item = %item, "dropping unrecognized control message");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------
// Server -> client control messages
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AnnounceParams {
    pub name: String,
    pub id: u32,
    #[serde(rename = "type")]
    pub type_str: String,
    pub properties: Properties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubuid: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnannounceParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertiesParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<bool>,
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ServerControlMessage {
    Announce(AnnounceParams),
    Unannounce(UnannounceParams),
    Properties(PropertiesParams),
}

/// Serialize a batch of outbound control messages as the JSON array NT4
/// expects on the text channel.
pub fn encode_control_batch(messages: &[ServerControlMessage]) -> String {
    serde_json::to_string(messages).expect("control messages are always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_publish_message() {
        let text = r#"[{"method":"publish","params":{"name":"/a","type":"double","pubuid":7,"properties":{}}}]"#;
        let messages = decode_control_batch(text);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ClientControlMessage::Publish(p) => {
                assert_eq!(p.name, "/a");
                assert_eq!(p.type_str, "double");
                assert_eq!(p.pubuid, 7);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_dropped_without_failing_batch() {
        let text = r#"[{"method":"bogus","params":{}},{"method":"unpublish","params":{"pubuid":1}}]"#;
        let messages = decode_control_batch(text);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], ClientControlMessage::Unpublish(_)));
    }

    #[test]
    fn encodes_announce_message() {
        let batch = vec![ServerControlMessage::Announce(AnnounceParams {
            name: "/a".into(),
            id: 1,
            type_str: "double".into(),
            properties: Properties::new(),
            pubuid: None,
        })];
        let json = encode_control_batch(&batch);
        assert_eq!(
            json,
            r#"[{"method":"announce","params":{"name":"/a","id":1,"type":"double","properties":{}}}]"#
        );
    }
}
