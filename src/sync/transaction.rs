// Transactions and materialization
//
// Groups an ordered message stream into transactions and replays them onto an
// in-memory table the way a destination would: deletes first, then upserts
// keyed by `$id`.

use std::collections::BTreeMap;

use serde::Serialize;

use super::protocol::{DataRecord, DeleteRecords, Message};

/// Messages between two `new_transaction` boundaries
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transaction {
    pub clear_stream: bool,
    pub deletes: Vec<DeleteRecords>,
    pub records: Vec<DataRecord>,
    /// Clear/delete messages that arrived after a record of this transaction
    pub late_deletes: usize,
}

impl Transaction {
    fn is_empty(&self) -> bool {
        !self.clear_stream && self.deletes.is_empty() && self.records.is_empty()
    }
}

/// Split messages into transactions
///
/// A transaction commits at the next `new_transaction` or at stream end.
/// Empty transactions (only logs or state) are dropped.
pub fn group(messages: &[Message]) -> Vec<Transaction> {
    let mut transactions = Vec::new();
    let mut current = Transaction::default();

    for message in messages {
        match message {
            Message::NewTransaction => {
                if !current.is_empty() {
                    transactions.push(std::mem::take(&mut current));
                }
            }
            Message::ClearStream => {
                if !current.records.is_empty() {
                    current.late_deletes += 1;
                }
                current.clear_stream = true;
            }
            Message::DeleteRecords(delete) => {
                if !current.records.is_empty() {
                    current.late_deletes += 1;
                }
                current.deletes.push(delete.clone());
            }
            Message::Record(record) => current.records.push(record.clone()),
            Message::Log(_) | Message::State(_) => {}
        }
    }

    if !current.is_empty() {
        transactions.push(current);
    }

    for (index, tx) in transactions.iter().enumerate() {
        if tx.late_deletes > 0 {
            log::warn!(
                "Transaction {} has {} clear/delete message(s) after its first record; applying them to the whole transaction",
                index,
                tx.late_deletes
            );
        }
    }

    transactions
}

/// Destination-style view of a stream after all transactions are applied
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaterializedTable {
    rows: BTreeMap<String, DataRecord>,
}

impl MaterializedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed transaction
    ///
    /// Clear and delete take effect before any record of the transaction,
    /// wherever they appeared inside it.
    pub fn apply(&mut self, tx: &Transaction) {
        if tx.clear_stream {
            self.rows.clear();
        }
        for delete in &tx.deletes {
            self.rows.retain(|_, row| !delete.matches(row));
        }
        for record in &tx.records {
            self.rows.insert(record.id.clone(), record.clone());
        }
    }

    pub fn get(&self, id: &str) -> Option<&DataRecord> {
        self.rows.get(id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &DataRecord> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Replay a full message stream onto an empty table
pub fn materialize(messages: &[Message]) -> MaterializedTable {
    let mut table = MaterializedTable::new();
    for tx in group(messages) {
        table.apply(&tx);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::Granularity;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn rec(id: &str, value: i64) -> Message {
        Message::Record(DataRecord::new(id).with_field("value", json!(value)))
    }

    fn rec_on(id: &str, day: u32) -> Message {
        Message::Record(
            DataRecord::new(id).with_timestamp(Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()),
        )
    }

    #[test]
    fn test_upsert_keeps_last_record_per_id() {
        let messages = vec![rec("a", 1), rec("b", 1), rec("a", 2), rec("a", 3)];
        let table = materialize(&messages);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("a").unwrap().fields["value"], json!(3));
    }

    #[test]
    fn test_group_splits_on_new_transaction() {
        let messages = vec![
            rec("a", 1),
            Message::NewTransaction,
            Message::NewTransaction,
            Message::ClearStream,
            rec("b", 1),
        ];
        let txs = group(&messages);

        assert_eq!(txs.len(), 2);
        assert!(!txs[0].clear_stream);
        assert!(txs[1].clear_stream);
        assert_eq!(txs[1].late_deletes, 0);
    }

    #[test]
    fn test_clear_stream_replaces_previous_rows() {
        let messages = vec![
            rec("a", 1),
            rec("b", 1),
            Message::NewTransaction,
            Message::ClearStream,
            rec("c", 1),
        ];
        let table = materialize(&messages);

        assert_eq!(table.rows().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_delete_records_removes_partition_only() {
        let messages = vec![
            rec_on("jan1", 1),
            rec_on("jan2", 2),
            Message::NewTransaction,
            Message::DeleteRecords(DeleteRecords {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                granularity: Granularity::Day,
            }),
            rec_on("jan2-new", 2),
        ];
        let table = materialize(&messages);

        assert!(table.get("jan1").is_some());
        assert!(table.get("jan2").is_none());
        assert!(table.get("jan2-new").is_some());
    }

    #[test]
    fn test_late_clear_applies_to_whole_transaction() {
        let messages = vec![
            rec("old", 1),
            Message::NewTransaction,
            rec("a", 1),
            Message::ClearStream,
            rec("b", 1),
        ];
        let txs = group(&messages);
        assert_eq!(txs[1].late_deletes, 1);

        let table = materialize(&messages);
        let ids: Vec<_> = table.rows().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_late_delete_applies_before_transaction_records() {
        let messages = vec![
            rec_on("jan2", 2),
            Message::NewTransaction,
            rec_on("jan2-a", 2),
            Message::DeleteRecords(DeleteRecords {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                granularity: Granularity::Day,
            }),
            rec_on("jan2-b", 2),
        ];
        let txs = group(&messages);
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].late_deletes, 1);
        assert_eq!(txs[1].deletes.len(), 1);

        // The delete covers the earlier transaction's row, never this transaction's own records
        let table = materialize(&messages);
        let ids: Vec<_> = table.rows().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["jan2-a", "jan2-b"]);
    }

    #[test]
    fn test_state_and_logs_do_not_open_transactions() {
        let messages = vec![
            Message::State(json!({ "cursor": 1 }).as_object().unwrap().clone()),
            Message::NewTransaction,
            rec("a", 1),
        ];
        assert_eq!(group(&messages).len(), 1);
    }
}
