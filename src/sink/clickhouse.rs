//! ClickHouse store, one row per record
use std::sync::Arc;

use async_trait::async_trait;
use clickhouse_rs::{types::Value as CHValue, Block, Pool};

use super::{RecordSink, SinkError};
use crate::{record::Record, value::Value};

/// ClickHouse row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, CHValue)>;

pub struct ClickHouseSink {
    pool: Pool,
    table: String,
}

impl ClickHouseSink {
    pub fn new(url: &str, table: &str) -> ClickHouseSink {
        ClickHouseSink {
            pool: Pool::new(url),
            table: table.to_owned(),
        }
    }
}

/// Source coordinates go to `_`-prefixed columns, fields to columns of the same name
fn record2row(record: &Record) -> Result<Row, SinkError> {
    let mut row = Row::with_capacity(record.fields().len() + 4);
    row.push((String::from("_topic"), CHValue::from(record.topic().to_owned())));
    row.push((String::from("_partition"), CHValue::from(record.partition())));
    row.push((String::from("_offset"), CHValue::from(record.offset())));
    row.push((
        String::from("_timestamp"),
        CHValue::from(record.timestamp().timestamp_millis()),
    ));
    for (column, value) in record.fields() {
        let v = value2ch(value)
            .map_err(|e| SinkError::Encode(format!("{} column {column}: {e}", record.key())))?;
        row.push((column.to_owned(), v));
    }
    Ok(row)
}

fn value2ch(v: &Value) -> Result<CHValue, String> {
    match v {
        Value::Null => Err(String::from("unexpected null")),
        Value::Bool(x) => Ok(CHValue::from(*x)),
        Value::Int(x) => Ok(CHValue::from(*x)),
        Value::Float(x) => Ok(CHValue::from(*x)),
        Value::String(x) => Ok(CHValue::from(x.to_owned())),
        Value::Bytes(x) => Ok(CHValue::String(Arc::new(x.to_owned()))),
        // nested values are stored as JSON strings
        Value::Sequence(_) | Value::Mapping(_) => serde_json::to_string(v)
            .map(CHValue::from)
            .map_err(|e| e.to_string()),
    }
}

#[async_trait]
impl RecordSink for ClickHouseSink {
    fn name(&self) -> &str {
        "clickhouse"
    }

    fn validate(&self, record: &Record) -> Result<(), SinkError> {
        record2row(record).map(|_| ())
    }

    async fn insert(&self, records: &[Record]) -> Result<(), SinkError> {
        let mut block = Block::with_capacity(records.len());
        for record in records {
            block
                .push(record2row(record)?)
                .map_err(|e| SinkError::Encode(e.to_string()))?;
        }
        let mut ch = self
            .pool
            .get_handle()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        ch.insert(&self.table, block)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Rejected(format!("inserting batch to CH: {e}")))
    }

    async fn check(&self) -> Result<(), SinkError> {
        let mut ch = self
            .pool
            .get_handle()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        ch.ping()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::record::normalize;

    fn record(fields: Vec<(Value, Value)>) -> Record {
        normalize(Value::Mapping(fields), "t", 1, 5, DateTime::UNIX_EPOCH).unwrap()
    }

    #[test]
    fn row_has_coordinates_then_fields() {
        let row = record2row(&record(vec![
            (Value::from("b"), Value::from("x")),
            (Value::from("a"), Value::Sequence(vec![Value::Int(1)])),
        ]))
        .unwrap();
        let columns: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(columns, ["_topic", "_partition", "_offset", "_timestamp", "a", "b"]);
    }

    #[test]
    fn nulls_are_rejected() {
        assert!(matches!(
            record2row(&record(vec![(Value::from("a"), Value::Null)])),
            Err(SinkError::Encode(_))
        ));
    }
}
