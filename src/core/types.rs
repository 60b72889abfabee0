use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Named values for error severities reported by `p4`
pub mod severity {
    /// nothing yet
    pub const E_EMPTY: i64 = 0;
    /// something good happened
    pub const E_INFO: i64 = 1;
    /// something not good happened
    pub const E_WARN: i64 = 2;
    /// user did something wrong
    pub const E_FAILED: i64 = 3;
    /// system broken -- nothing can continue
    pub const E_FATAL: i64 = 4;
}

/// Named values for generic error codes reported by `p4`
pub mod generic {
    pub const EV_NONE: i64 = 0;

    // The fault of the user
    pub const EV_USAGE: i64 = 0x01;
    pub const EV_UNKNOWN: i64 = 0x02;
    pub const EV_CONTEXT: i64 = 0x03;
    pub const EV_ILLEGAL: i64 = 0x04;
    pub const EV_NOTYET: i64 = 0x05;
    pub const EV_PROTECT: i64 = 0x06;

    // No fault at all
    pub const EV_EMPTY: i64 = 0x11;

    // Not the fault of the user
    pub const EV_FAULT: i64 = 0x21;
    pub const EV_CLIENT: i64 = 0x22;
    pub const EV_ADMIN: i64 = 0x23;
    pub const EV_CONFIG: i64 = 0x24;
    pub const EV_UPGRADE: i64 = 0x25;
    pub const EV_COMM: i64 = 0x26;
    pub const EV_TOOBIG: i64 = 0x27;
}

/// A decoded field value.
///
/// The flat decoder only ever produces [`Value::Str`] and [`Value::Int`]; the
/// other variants come from the extended marshal decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::List(_) | Value::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

/// One decoded unit of a `p4 -G` reply.
///
/// Fields keep the order in which they appeared on the wire. The `code` field
/// (`stat`, `info`, `error`, `text`, `binary`, `prompt`) tags the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty record tagged with `code`
    pub fn with_code(code: impl Into<String>) -> Self {
        let mut record = Self::new();
        record.insert("code", Value::Str(code.into()));
        record
    }

    /// The record's `code` tag, if it has a string one
    pub fn code(&self) -> Option<&str> {
        self.get_str("code")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    /// Set `key`, replacing any previous value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn into_fields(self) -> IndexMap<String, Value> {
        self.fields
    }
}

impl From<IndexMap<String, Value>> for Record {
    fn from(fields: IndexMap<String, Value>) -> Self {
        Self { fields }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Data fed to the child's standard input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Written verbatim (passwords for `login`, legacy text input)
    Text(String),
    /// Marshalled as one request dictionary; values are display strings
    Map(IndexMap<String, String>),
}

impl Payload {
    /// An empty request dictionary, to be filled with [`Payload::with`]
    pub fn map() -> Self {
        Payload::Map(IndexMap::new())
    }

    /// Add an entry to a map payload, coercing the value to its display form.
    /// On a text payload this is a no-op.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        if let Payload::Map(map) = &mut self {
            map.insert(key.into(), value.to_string());
        }
        self
    }

    /// Whether anything should be written to stdin at all.
    /// An empty text is nothing; an empty map still encodes as `{0`.
    pub fn should_write(&self) -> bool {
        match self {
            Payload::Text(text) => !text.is_empty(),
            Payload::Map(_) => true,
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<IndexMap<String, String>> for Payload {
    fn from(map: IndexMap<String, String>) -> Self {
        Payload::Map(map)
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Payload::Map(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        )
    }
}

/// Aggregated outcome of one codec'd invocation.
///
/// Records are bucketed by their `code` into lists (`stat`, `info`, `error`,
/// ...) in first-appearance order; `text`/`binary` chunks are concatenated
/// into `data`.
///
/// Serialized as one flat JSON object: every list under its code, then
/// `data` and `prompt` when present. A list whose code is itself `data` or
/// `prompt` is written as `data_list` / `prompt_list` so no key repeats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct P4Result {
    lists: IndexMap<String, Vec<Record>>,
    pub data: Option<String>,
    pub prompt: Option<String>,
    undecodable: bool,
}

/// Keys taken by the scalar fields of a serialized [`P4Result`]
const SCALAR_KEYS: [&str; 2] = ["data", "prompt"];

impl Serialize for P4Result {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (code, records) in &self.lists {
            if SCALAR_KEYS.contains(&code.as_str()) {
                map.serialize_entry(&format!("{}_list", code), records)?;
            } else {
                map.serialize_entry(code, records)?;
            }
        }
        if let Some(data) = &self.data {
            map.serialize_entry("data", data)?;
        }
        if let Some(prompt) = &self.prompt {
            map.serialize_entry("prompt", prompt)?;
        }
        map.end()
    }
}

impl P4Result {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stat(&self) -> Option<&[Record]> {
        self.list("stat")
    }

    pub fn info(&self) -> Option<&[Record]> {
        self.list("info")
    }

    pub fn error(&self) -> Option<&[Record]> {
        self.list("error")
    }

    /// Records collected under `code`, if any appeared
    pub fn list(&self, code: &str) -> Option<&[Record]> {
        self.lists.get(code).map(Vec::as_slice)
    }

    /// Codes that produced a list, in first-appearance order
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    /// Append `record` to the list for `code`, creating it if absent
    pub fn push(&mut self, code: impl Into<String>, record: Record) {
        self.lists.entry(code.into()).or_default().push(record);
    }

    /// Replace the list for `code` wholesale
    pub fn set_list(&mut self, code: impl Into<String>, records: Vec<Record>) {
        self.lists.insert(code.into(), records);
    }

    /// Whether `p4` reported at least one error record
    pub fn has_errors(&self) -> bool {
        self.error().map_or(false, |errors| !errors.is_empty())
    }

    /// True when stdout could not be decoded and `data` holds it verbatim
    pub fn is_undecodable(&self) -> bool {
        self.undecodable
    }

    pub(crate) fn mark_undecodable(&mut self) {
        self.undecodable = true;
    }
}

/// Outcome of one raw (non-codec) invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    pub text: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_insertion_order() {
        let mut record = Record::with_code("stat");
        record.insert("depotFile", "//depot/a");
        record.insert("rev", 3u32);
        let keys: Vec<&String> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["code", "depotFile", "rev"]);
        assert_eq!(record.code(), Some("stat"));
        assert_eq!(record.get_int("rev"), Some(3));
    }

    #[test]
    fn test_record_serializes_flat() {
        let record: Record = [("code", Value::from("stat")), ("Foo", Value::from("1"))]
            .into_iter()
            .collect();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"code": "stat", "Foo": "1"}));
    }

    #[test]
    fn test_payload_coerces_values() {
        let payload = Payload::map().with("Change", "new").with("Count", 42);
        match payload {
            Payload::Map(map) => {
                assert_eq!(map.get("Change").map(String::as_str), Some("new"));
                assert_eq!(map.get("Count").map(String::as_str), Some("42"));
            }
            _ => panic!("Expected map payload"),
        }
    }

    #[test]
    fn test_payload_should_write() {
        assert!(!Payload::from("").should_write());
        assert!(Payload::from("secret").should_write());
        assert!(Payload::map().should_write());
    }

    #[test]
    fn test_result_serialization_omits_absent_fields() {
        let mut result = P4Result::new();
        result.push("stat", Record::with_code("stat"));
        result.data = Some("abcd".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"stat": [{"code": "stat"}], "data": "abcd"})
        );
    }

    #[test]
    fn test_result_serialization_keeps_keys_unique() {
        let mut result = P4Result::new();
        result.push("data", Record::with_code("data"));
        result.push("prompt", Record::with_code("prompt"));
        result.data = Some("abcd".to_string());
        result.prompt = Some("Enter password: ".to_string());

        let text = serde_json::to_string(&result).unwrap();
        assert_eq!(text.matches("\"data\":").count(), 1);
        assert_eq!(text.matches("\"prompt\":").count(), 1);

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["data"], "abcd");
        assert_eq!(json["prompt"], "Enter password: ");
        assert_eq!(json["data_list"], serde_json::json!([{"code": "data"}]));
        assert_eq!(json["prompt_list"], serde_json::json!([{"code": "prompt"}]));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::from("x").to_string(), "x");
        assert_eq!(Value::Int(7).to_string(), "7");
        assert_eq!(Value::Null.to_string(), "None");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::from("a")]).to_string(),
            "[1,\"a\"]"
        );
    }
}
