use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged value read from a PLC tag.
///
/// Serializes as `{"k": kind, "v": value}` (`v` omitted for `Null`);
/// array and struct members are the same tagged union, so arbitrarily
/// nested UDT reads stay JSON-serializable without a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k", content = "v", rename_all = "lowercase")]
pub enum PlcValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<PlcValue>),
    Struct(BTreeMap<String, PlcValue>),
}

impl PlcValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PlcValue::Null => "null",
            PlcValue::Bool(_) => "bool",
            PlcValue::Int32(_) => "int32",
            PlcValue::Int64(_) => "int64",
            PlcValue::Float(_) => "float",
            PlcValue::Double(_) => "double",
            PlcValue::String(_) => "string",
            PlcValue::Bytes(_) => "bytes",
            PlcValue::Array(_) => "array",
            PlcValue::Struct(_) => "struct",
        }
    }
}
