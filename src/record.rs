//! Canonical record and the normalizer building it from a decoded value
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("decoded value is a {0}, expected a mapping")]
    NotAMapping(&'static str),
    #[error("mapping has a non-string key of type {0}")]
    NonStringKey(&'static str),
}

/// Normalized output unit: source coordinates plus top-level decoded fields
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    timestamp: DateTime<Utc>,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Stable identity of the source message, same across redeliveries
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

/// Builds a [Record] from decoded value.
/// Only the top level is checked; nested values are taken as is.
pub fn normalize(
    decoded: Value,
    topic: &str,
    partition: i32,
    offset: i64,
    timestamp: DateTime<Utc>,
) -> Result<Record, NormalizeError> {
    let entries = match decoded {
        Value::Mapping(entries) => entries,
        other => return Err(NormalizeError::NotAMapping(other.kind())),
    };
    let mut fields = BTreeMap::new();
    for (key, value) in entries {
        match key {
            Value::String(key) => {
                fields.insert(key, value);
            }
            other => return Err(NormalizeError::NonStringKey(other.kind())),
        }
    }
    Ok(Record {
        topic: topic.to_owned(),
        partition,
        offset,
        timestamp,
        fields,
    })
}
