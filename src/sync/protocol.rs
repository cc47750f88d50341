// Stream Protocol Types
//
// The message algebra a source emits through its stream sink, and the data
// record that travels inside `record` messages.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key prefix for per-field SQL type hints
pub const SQL_TYPE_PREFIX: &str = "__sql_type_";
pub const ID_FIELD: &str = "$id";
pub const TIMESTAMP_FIELD: &str = "$recordTimestamp";

/// A single upsertable row emitted by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct DataRecord {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
    pub sql_types: BTreeMap<String, String>,
}

impl DataRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: None,
            fields: Map::new(),
            sql_types: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

impl TryFrom<Map<String, Value>> for DataRecord {
    type Error = String;

    fn try_from(mut raw: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = match raw.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => return Err(format!("record `{}` must be a non-empty string or number, got {}", ID_FIELD, other)),
            None => return Err(format!("record is missing `{}`", ID_FIELD)),
        };

        let timestamp = match raw.remove(TIMESTAMP_FIELD) {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_timestamp(&value)?),
        };

        let mut fields = Map::new();
        let mut sql_types = BTreeMap::new();
        for (key, value) in raw {
            if let Some(field) = key.strip_prefix(SQL_TYPE_PREFIX) {
                match value {
                    Value::String(sql_type) => {
                        sql_types.insert(field.to_string(), sql_type);
                    }
                    other => return Err(format!("SQL type hint `{}` must be a string, got {}", key, other)),
                }
                continue;
            }
            if value.is_object() {
                return Err(format!(
                    "record `{}` field `{}` is a nested object; flatten it before emitting",
                    id, key
                ));
            }
            fields.insert(key, value);
        }

        Ok(Self {
            id,
            timestamp,
            fields,
            sql_types,
        })
    }
}

impl From<DataRecord> for Map<String, Value> {
    fn from(record: DataRecord) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(record.id));
        if let Some(ts) = record.timestamp {
            map.insert(TIMESTAMP_FIELD.to_string(), Value::String(ts.to_rfc3339()));
        }
        map.extend(record.fields);
        for (field, sql_type) in record.sql_types {
            map.insert(format!("{}{}", SQL_TYPE_PREFIX, field), Value::String(sql_type));
        }
        map
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp `{}`: {}", s, e)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| format!("invalid epoch milliseconds timestamp {}", n)),
        other => Err(format!("timestamp must be a string or number, got {}", other)),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parse_timestamp(&value).map_err(serde::de::Error::custom)
}

/// Size of the time partition a `delete_records` message targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Start of the partition that contains `ts`
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let day = Utc
            .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
            .single()
            .unwrap_or(ts);
        match self {
            Granularity::Hour => day + Duration::hours(i64::from(ts.hour())),
            Granularity::Day => day,
            Granularity::Week => day - Duration::days(i64::from(ts.weekday().num_days_from_monday())),
            Granularity::Month => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(day),
            Granularity::Year => Utc
                .with_ymd_and_hms(ts.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(day),
        }
    }

    /// Stable key naming the partition of `ts`
    pub fn partition_key(&self, ts: DateTime<Utc>) -> String {
        format!("{}:{}", self, self.truncate(ts).to_rfc3339())
    }

    pub fn same_partition(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.truncate(a) == self.truncate(b)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRecords {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub granularity: Granularity,
}

impl DeleteRecords {
    pub fn matches(&self, record: &DataRecord) -> bool {
        record
            .timestamp
            .is_some_and(|ts| self.granularity.same_partition(ts, self.timestamp))
    }
}

/// One protocol message, in the order the source emitted it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum Message {
    Record(DataRecord),
    Log(LogMessage),
    State(Map<String, Value>),
    ClearStream,
    DeleteRecords(DeleteRecords),
    NewTransaction,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Record(_) => "record",
            Message::Log(_) => "log",
            Message::State(_) => "state",
            Message::ClearStream => "clear_stream",
            Message::DeleteRecords(_) => "delete_records",
            Message::NewTransaction => "new_transaction",
        }
    }
}
