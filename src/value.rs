//! Dynamic NT4 values and the type-string / type-index mapping (spec.md §3, §6).

use rmpv::Value as Msg;

/// A dynamically typed NT value: booleans, numbers, strings, blobs, and
/// homogeneous arrays of each.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

/// Binary-frame type index (spec.md §6).
pub const TYPE_BOOLEAN: u8 = 0;
pub const TYPE_DOUBLE: u8 = 1;
pub const TYPE_INT: u8 = 2;
pub const TYPE_FLOAT: u8 = 3;
pub const TYPE_STRING: u8 = 4;
pub const TYPE_RAW: u8 = 5;
pub const TYPE_BOOLEAN_ARRAY: u8 = 16;
pub const TYPE_DOUBLE_ARRAY: u8 = 17;
pub const TYPE_INT_ARRAY: u8 = 18;
pub const TYPE_FLOAT_ARRAY: u8 = 19;
pub const TYPE_STRING_ARRAY: u8 = 20;

/// Maps a declared topic type string (spec.md §3) to its binary type index.
/// `rpc`, `msgpack`, and `protobuf` all alias the raw-blob index.
pub fn type_index_for_type_str(type_str: &str) -> Option<u8> {
    match type_str {
        "boolean" => Some(TYPE_BOOLEAN),
        "double" => Some(TYPE_DOUBLE),
        "int" => Some(TYPE_INT),
        "float" => Some(TYPE_FLOAT),
        "string" => Some(TYPE_STRING),
        "raw" | "rpc" | "msgpack" | "protobuf" => Some(TYPE_RAW),
        "boolean[]" => Some(TYPE_BOOLEAN_ARRAY),
        "double[]" => Some(TYPE_DOUBLE_ARRAY),
        "int[]" => Some(TYPE_INT_ARRAY),
        "float[]" => Some(TYPE_FLOAT_ARRAY),
        "string[]" => Some(TYPE_STRING_ARRAY),
        _ => None,
    }
}

impl Value {
    /// The binary type index this value would be tagged with on the wire.
    pub fn type_index(&self) -> u8 {
        match self {
            Value::Bool(_) => TYPE_BOOLEAN,
            Value::Double(_) => TYPE_DOUBLE,
            Value::Int(_) => TYPE_INT,
            Value::Float(_) => TYPE_FLOAT,
            Value::String(_) => TYPE_STRING,
            Value::Bytes(_) => TYPE_RAW,
            Value::BoolArray(_) => TYPE_BOOLEAN_ARRAY,
            Value::DoubleArray(_) => TYPE_DOUBLE_ARRAY,
            Value::IntArray(_) => TYPE_INT_ARRAY,
            Value::FloatArray(_) => TYPE_FLOAT_ARRAY,
            Value::StringArray(_) => TYPE_STRING_ARRAY,
        }
    }

    /// Encode this value as a MessagePack value, per the element encoding in
    /// spec.md §4.1.
    pub fn to_msgpack(&self) -> Msg {
        match self {
            Value::Bool(b) => Msg::Boolean(*b),
            Value::Int(i) => Msg::Integer((*i).into()),
            Value::Float(f) => Msg::F32(*f),
            Value::Double(d) => Msg::F64(*d),
            Value::String(s) => Msg::String(s.clone().into()),
            Value::Bytes(b) => Msg::Binary(b.clone()),
            Value::BoolArray(v) => Msg::Array(v.iter().map(|b| Msg::Boolean(*b)).collect()),
            Value::IntArray(v) => Msg::Array(v.iter().map(|i| Msg::Integer((*i).into())).collect()),
            Value::FloatArray(v) => Msg::Array(v.iter().map(|f| Msg::F32(*f)).collect()),
            Value::DoubleArray(v) => Msg::Array(v.iter().map(|d| Msg::F64(*d)).collect()),
            Value::StringArray(v) => {
                Msg::Array(v.iter().map(|s| Msg::String(s.clone().into())).collect())
            }
        }
    }

    /// Decode a MessagePack value against an expected type index. Returns
    /// `None` if the payload's shape doesn't match the declared type.
    pub fn from_msgpack(type_index: u8, msg: &Msg) -> Option<Value> {
        match type_index {
            TYPE_BOOLEAN => msg.as_bool().map(Value::Bool),
            TYPE_DOUBLE => msg.as_f64().map(Value::Double),
            TYPE_INT => msg.as_i64().map(Value::Int),
            TYPE_FLOAT => msg.as_f64().map(|f| Value::Float(f as f32)),
            TYPE_STRING => msg.as_str().map(|s| Value::String(s.to_owned())),
            TYPE_RAW => msg.as_slice().map(|b| Value::Bytes(b.to_vec())),
            TYPE_BOOLEAN_ARRAY => msg
                .as_array()
                .map(|a| a.iter().filter_map(Msg::as_bool).collect())
                .map(Value::BoolArray),
            TYPE_DOUBLE_ARRAY => msg
                .as_array()
                .map(|a| a.iter().filter_map(Msg::as_f64).collect())
                .map(Value::DoubleArray),
            TYPE_INT_ARRAY => msg
                .as_array()
                .map(|a| a.iter().filter_map(Msg::as_i64).collect())
                .map(Value::IntArray),
            TYPE_FLOAT_ARRAY => msg
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect())
                .map(Value::FloatArray),
            TYPE_STRING_ARRAY => msg
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect()
                })
                .map(Value::StringArray),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_index_round_trips_for_each_tag() {
        let cases = [
            Value::Bool(true),
            Value::Int(42),
            Value::Float(1.5),
            Value::Double(3.14),
            Value::String("hi".into()),
            Value::Bytes(vec![1, 2, 3]),
            Value::BoolArray(vec![true, false]),
            Value::IntArray(vec![1, 2, 3]),
            Value::FloatArray(vec![1.0, 2.0]),
            Value::DoubleArray(vec![1.0, 2.0]),
            Value::StringArray(vec!["a".into(), "b".into()]),
        ];

        for value in cases {
            let idx = value.type_index();
            let encoded = value.to_msgpack();
            let decoded = Value::from_msgpack(idx, &encoded).expect("decodes");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn aliases_map_to_raw_type_index() {
        for alias in ["raw", "rpc", "msgpack", "protobuf"] {
            assert_eq!(type_index_for_type_str(alias), Some(TYPE_RAW));
        }
    }

    #[test]
    fn type_mismatch_decode_fails() {
        let value = Value::String("hello".into()).to_msgpack();
        assert!(Value::from_msgpack(TYPE_DOUBLE, &value).is_none());
    }
}
