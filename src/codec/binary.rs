//! Binary-channel (MessagePack) codec (spec.md §4.1, §6).
//!
//! Decoding prefers MessagePack; a binary frame that fails to parse as
//! MessagePack falls back to UTF-8 JSON (tolerated for legacy clients).
//! Frames that decode as neither yield `DecodedFrame::Unknown` and are
//! logged but never close the connection (spec.md §4.1, §4.7).

use rmpv::Value as Msg;
use tracing::trace;

use crate::value::Value;

#[derive(Debug, Clone)]
pub enum DecodedFrame {
    /// `[id >= 0, timestamp_us, type_index, value]`
    Value {
        id: u32,
        timestamp_us: u64,
        type_index: u8,
        payload: Msg,
    },
    /// `[-1, clientIndex, seq, clientTime_us]`
    TimeSyncRequest {
        client_index: i64,
        seq: i64,
        client_time_us: i64,
    },
    Unknown,
}

pub fn decode_binary(bytes: &[u8]) -> DecodedFrame {
    if let Some(frame) = decode_msgpack(bytes) {
        return frame;
    }
    if let Some(frame) = decode_json_fallback(bytes) {
        trace!("decoded binary frame via JSON fallback");
        return frame;
    }
    DecodedFrame::Unknown
}

fn decode_msgpack(bytes: &[u8]) -> Option<DecodedFrame> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    frame_from_array(value.as_array()?)
}

fn decode_json_fallback(bytes: &[u8]) -> Option<DecodedFrame> {
    let text = std::str::from_utf8(bytes).ok()?;
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let id = arr.first()?.as_i64()?;
    if id == -1 {
        let client_index = arr.get(1)?.as_i64()?;
        let seq = arr.get(2)?.as_i64()?;
        let client_time_us = arr.get(3)?.as_i64()?;
        return Some(DecodedFrame::TimeSyncRequest {
            client_index,
            seq,
            client_time_us,
        });
    }
    if id < 0 {
        return None;
    }
    let timestamp_us = arr.get(1)?.as_u64()?;
    let type_index = arr.get(2)?.as_u64()? as u8;
    let payload = json_to_msgpack(arr.get(3)?);
    Some(DecodedFrame::Value {
        id: id as u32,
        timestamp_us,
        type_index,
        payload,
    })
}

fn frame_from_array(arr: &[Msg]) -> Option<DecodedFrame> {
    let id = arr.first()?.as_i64()?;
    if id == -1 {
        let client_index = arr.get(1)?.as_i64()?;
        let seq = arr.get(2)?.as_i64()?;
        let client_time_us = arr.get(3)?.as_i64()?;
        return Some(DecodedFrame::TimeSyncRequest {
            client_index,
            seq,
            client_time_us,
        });
    }
    if id < 0 {
        return None;
    }
    let timestamp_us = arr.get(1)?.as_u64()?;
    let type_index = arr.get(2)?.as_u64()? as u8;
    let payload = arr.get(3)?.clone();
    Some(DecodedFrame::Value {
        id: id as u32,
        timestamp_us,
        type_index,
        payload,
    })
}

fn json_to_msgpack(v: &serde_json::Value) -> Msg {
    match v {
        serde_json::Value::Null => Msg::Nil,
        serde_json::Value::Bool(b) => Msg::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Msg::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                Msg::Integer(u.into())
            } else {
                Msg::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Msg::String(s.clone().into()),
        serde_json::Value::Array(a) => Msg::Array(a.iter().map(json_to_msgpack).collect()),
        serde_json::Value::Object(_) => Msg::Nil,
    }
}

/// Encode a `[id, timestamp_us, typeIndex, value]` value frame.
pub fn encode_value_frame(id: u32, timestamp_us: u64, value: &Value) -> Vec<u8> {
    let array = Msg::Array(vec![
        Msg::Integer((id as i64).into()),
        Msg::Integer(timestamp_us.into()),
        Msg::Integer((value.type_index() as i64).into()),
        value.to_msgpack(),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &array).expect("encoding into a Vec cannot fail");
    buf
}

/// Encode a `[-1, clientIndex, seq, clientTime_us, serverTime_us]` time-sync reply.
pub fn encode_timesync_response(
    client_index: i64,
    seq: i64,
    client_time_us: i64,
    server_time_us: u64,
) -> Vec<u8> {
    let array = Msg::Array(vec![
        Msg::Integer((-1i64).into()),
        Msg::Integer(client_index.into()),
        Msg::Integer(seq.into()),
        Msg::Integer(client_time_us.into()),
        Msg::Integer(server_time_us.into()),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &array).expect("encoding into a Vec cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value_frame() {
        let value = Value::Double(3.14);
        let bytes = encode_value_frame(1, 1_000_000, &value);
        match decode_binary(&bytes) {
            DecodedFrame::Value {
                id,
                timestamp_us,
                type_index,
                payload,
            } => {
                assert_eq!(id, 1);
                assert_eq!(timestamp_us, 1_000_000);
                assert_eq!(type_index, value.type_index());
                assert_eq!(Value::from_msgpack(type_index, &payload), Some(value));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn round_trips_a_timesync_request() {
        let bytes = encode_timesync_response(2, 42, 5000, 1_234_567);
        // The response isn't something the server ever decodes, but the
        // request shape (one element shorter) is — verify that separately.
        let request = Msg::Array(vec![
            Msg::Integer((-1i64).into()),
            Msg::Integer(2i64.into()),
            Msg::Integer(42i64.into()),
            Msg::Integer(5000i64.into()),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &request).unwrap();
        match decode_binary(&buf) {
            DecodedFrame::TimeSyncRequest {
                client_index,
                seq,
                client_time_us,
            } => {
                assert_eq!(client_index, 2);
                assert_eq!(seq, 42);
                assert_eq!(client_time_us, 5000);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(!bytes.is_empty());
    }

    #[test]
    fn malformed_bytes_yield_unknown() {
        let garbage = [0xffu8; 8];
        assert!(matches!(decode_binary(&garbage), DecodedFrame::Unknown));
    }
}
