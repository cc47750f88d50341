// Stream Sinks
//
// A sink is the only way a source hands data back to the host. StreamSink
// keeps every message in arrival order; PartitionedSink is the chunking
// helper that opens a fresh transaction whenever records cross into a new
// time partition.

use serde_json::{Map, Value};

use super::protocol::{DataRecord, DeleteRecords, Granularity, LogLevel, LogMessage, Message};

/// Receiver of protocol messages
pub trait MessageSink {
    fn emit(&mut self, message: Message);

    fn add_record(&mut self, record: DataRecord) {
        self.emit(Message::Record(record));
    }

    fn change_state(&mut self, state: Map<String, Value>) {
        self.emit(Message::State(state));
    }

    fn clear_stream(&mut self) {
        self.emit(Message::ClearStream);
    }

    fn new_transaction(&mut self) {
        self.emit(Message::NewTransaction);
    }

    fn delete_records(&mut self, delete: DeleteRecords) {
        self.emit(Message::DeleteRecords(delete));
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>)
    where
        Self: Sized,
    {
        self.emit(Message::Log(LogMessage {
            level,
            message: message.into(),
        }));
    }
}

impl MessageSink for Vec<Message> {
    fn emit(&mut self, message: Message) {
        self.push(message);
    }
}

/// Accumulates messages in the order they were emitted
#[derive(Debug, Default)]
pub struct StreamSink {
    messages: Vec<Message>,
    latest_state: Option<Map<String, Value>>,
}

impl StreamSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Payload of the most recent `state` message, if any
    pub fn latest_state(&self) -> Option<&Map<String, Value>> {
        self.latest_state.as_ref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl MessageSink for StreamSink {
    fn emit(&mut self, message: Message) {
        match &message {
            // Last write wins; nothing is merged
            Message::State(state) => self.latest_state = Some(state.clone()),
            Message::Log(entry) => {
                log::log!(target: "extension", log::Level::from(entry.level), "{}", entry.message)
            }
            _ => {}
        }
        self.messages.push(message);
    }
}

/// Splits records into time partitions, one transaction per partition
///
/// Each partition transaction starts with `delete_records` for the partition
/// so re-reading a partition replaces it instead of duplicating it.
#[derive(Debug, Clone)]
pub struct PartitionedSink {
    granularity: Granularity,
    current_partition_key: Option<String>,
}

impl PartitionedSink {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            current_partition_key: None,
        }
    }

    pub fn current_partition_key(&self) -> Option<&str> {
        self.current_partition_key.as_deref()
    }

    /// Route a record, opening a new partition transaction when needed
    pub fn add_record(&mut self, sink: &mut dyn MessageSink, record: DataRecord) -> Result<(), String> {
        let ts = record.timestamp.ok_or_else(|| {
            format!(
                "partitioned record `{}` needs `$recordTimestamp` to pick its {} partition",
                record.id, self.granularity
            )
        })?;

        let key = self.granularity.partition_key(ts);
        if self.current_partition_key.as_deref() != Some(key.as_str()) {
            sink.emit(Message::NewTransaction);
            sink.emit(Message::DeleteRecords(DeleteRecords {
                timestamp: self.granularity.truncate(ts),
                granularity: self.granularity,
            }));
            self.current_partition_key = Some(key);
        }

        sink.emit(Message::Record(record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record_at(id: &str, day: u32, hour: u32) -> DataRecord {
        DataRecord::new(id).with_timestamp(Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_stream_sink_keeps_order_and_latest_state() {
        let mut sink = StreamSink::new();
        sink.add_record(DataRecord::new("1"));
        sink.change_state(json!({ "cursor": 1 }).as_object().unwrap().clone());
        sink.new_transaction();
        sink.change_state(json!({ "cursor": 2 }).as_object().unwrap().clone());

        let kinds: Vec<_> = sink.messages().iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["record", "state", "new_transaction", "state"]);
        assert_eq!(sink.latest_state().unwrap()["cursor"], json!(2));
    }

    #[test]
    fn test_partitioned_sink_opens_transaction_per_partition() {
        let mut out: Vec<Message> = Vec::new();
        let mut partitions = PartitionedSink::new(Granularity::Day);

        partitions.add_record(&mut out, record_at("a", 1, 3)).unwrap();
        partitions.add_record(&mut out, record_at("b", 1, 20)).unwrap();
        partitions.add_record(&mut out, record_at("c", 2, 1)).unwrap();

        let kinds: Vec<_> = out.iter().map(Message::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "new_transaction",
                "delete_records",
                "record",
                "record",
                "new_transaction",
                "delete_records",
                "record"
            ]
        );
        match &out[5] {
            Message::DeleteRecords(delete) => {
                assert_eq!(delete.timestamp, Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_partitioned_sinks_are_independent() {
        let mut out: Vec<Message> = Vec::new();
        let mut hourly = PartitionedSink::new(Granularity::Hour);
        let mut daily = PartitionedSink::new(Granularity::Day);

        hourly.add_record(&mut out, record_at("a", 1, 3)).unwrap();
        daily.add_record(&mut out, record_at("b", 1, 3)).unwrap();

        assert_ne!(hourly.current_partition_key(), daily.current_partition_key());
        assert_eq!(out.iter().filter(|m| matches!(m, Message::NewTransaction)).count(), 2);
    }

    #[test]
    fn test_partitioned_sink_requires_timestamp() {
        let mut out: Vec<Message> = Vec::new();
        let mut partitions = PartitionedSink::new(Granularity::Month);
        assert!(partitions.add_record(&mut out, DataRecord::new("x")).is_err());
        assert!(out.is_empty());
    }
}
