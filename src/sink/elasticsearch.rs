//! Elasticsearch store, writes through the bulk API
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{RecordSink, SinkError};
use crate::record::Record;

pub struct ElasticsearchSink {
    client: reqwest::Client,
    url: String,
    index_prefix: String,
    date_suffix: bool,
}

#[derive(Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ClusterHealth {
    status: String,
}

impl ElasticsearchSink {
    pub fn new(
        url: &str,
        index_prefix: &str,
        date_suffix: bool,
        timeout: Duration,
    ) -> Result<ElasticsearchSink, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building elasticsearch client")?;
        Ok(ElasticsearchSink {
            client,
            url: url.trim_end_matches('/').to_owned(),
            index_prefix: index_prefix.to_owned(),
            date_suffix,
        })
    }

    /// `{prefix}-{topic}[-YYYY-MM-DD]`, lowercased as ES requires
    fn index_name(&self, record: &Record) -> String {
        let mut name = format!("{}-{}", self.index_prefix, record.topic());
        if self.date_suffix {
            name.push_str(&record.timestamp().format("-%Y-%m-%d").to_string());
        }
        name.to_lowercase()
    }

    /// NDJSON bulk request, record key is the document id so replays overwrite
    fn bulk_body(&self, records: &[Record]) -> Result<String, SinkError> {
        let mut body = String::new();
        for record in records {
            let action = json!({"index": {"_index": self.index_name(record), "_id": record.key()}});
            let doc = serde_json::to_string(record.fields())
                .map_err(|e| SinkError::Encode(format!("record {}: {e}", record.key())))?;
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Bulk failure counts as unavailability only when every failed item was throttled
fn bulk_error(items: &[serde_json::Value]) -> SinkError {
    let failed: Vec<&serde_json::Value> = items
        .iter()
        .filter_map(|item| item.as_object()?.values().next())
        .filter(|op| op.get("error").is_some())
        .collect();
    let message = failed
        .first()
        .and_then(|op| op.get("error"))
        .map(|e| e.to_string())
        .unwrap_or_else(|| String::from("unknown bulk error"));
    let throttled = |op: &&serde_json::Value| {
        op.get("status").and_then(serde_json::Value::as_u64)
            == Some(u64::from(StatusCode::TOO_MANY_REQUESTS.as_u16()))
    };
    if !failed.is_empty() && failed.iter().all(throttled) {
        SinkError::Unavailable(message)
    } else {
        SinkError::Rejected(message)
    }
}

#[async_trait]
impl RecordSink for ElasticsearchSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    fn validate(&self, record: &Record) -> Result<(), SinkError> {
        serde_json::to_string(record.fields())
            .map(|_| ())
            .map_err(|e| SinkError::Encode(format!("record {}: {e}", record.key())))
    }

    async fn insert(&self, records: &[Record]) -> Result<(), SinkError> {
        let body = self.bulk_body(records)?;
        let resp = self
            .client
            .post(format!("{}/_bulk", self.url))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SinkError::Unavailable(format!("bulk request: {status}")));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected(format!("bulk request: {status}: {text}")));
        }
        let bulk: BulkResponse = resp
            .json()
            .await
            .map_err(|e| SinkError::Unavailable(format!("reading bulk response: {e}")))?;
        if bulk.errors {
            return Err(bulk_error(&bulk.items));
        }
        Ok(())
    }

    async fn check(&self) -> Result<(), SinkError> {
        let health: ClusterHealth = self
            .client
            .get(format!("{}/_cluster/health", self.url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SinkError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        match health.status.as_str() {
            "red" => Err(SinkError::Unavailable(String::from("cluster status is red"))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{record::normalize, sink::Store, value::Value};

    fn sink(date_suffix: bool) -> ElasticsearchSink {
        ElasticsearchSink::new("http://127.0.0.1:1/", "injector", date_suffix, Duration::from_secs(1))
            .unwrap()
    }

    fn record() -> Record {
        normalize(
            Value::Mapping(vec![
                (Value::from("a"), Value::Int(42)),
                (Value::from("b"), Value::Sequence(vec![Value::from("x")])),
            ]),
            "Events",
            2,
            10,
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn index_names() {
        assert_eq!(sink(false).index_name(&record()), "injector-events");
        assert_eq!(sink(true).index_name(&record()), "injector-events-2023-11-14");
    }

    #[test]
    fn bulk_body_pairs_action_and_document() {
        let body = sink(false).bulk_body(&[record(), record()]).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            json!({"index": {"_index": "injector-events", "_id": "Events:2:10"}})
        );
        assert_eq!(lines[1], json!({"a": 42, "b": ["x"]}));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn unserializable_fields_fail_encoding() {
        let record = normalize(
            Value::Mapping(vec![(
                Value::from("m"),
                Value::Mapping(vec![(Value::Int(1), Value::Null)]),
            )]),
            "t",
            0,
            0,
            DateTime::UNIX_EPOCH,
        )
        .unwrap();
        assert!(matches!(sink(false).validate(&record), Err(SinkError::Encode(_))));
        assert!(matches!(
            sink(false).bulk_body(&[record]),
            Err(SinkError::Encode(_))
        ));
        assert!(sink(false).validate(&self::record()).is_ok());
    }

    #[test]
    fn bulk_item_failures() {
        let items = vec![
            json!({"index": {"status": 201}}),
            json!({"index": {"status": 400, "error": {"type": "mapper_parsing_exception"}}}),
            json!({"index": {"status": 429, "error": {"type": "es_rejected_execution_exception"}}}),
        ];
        match bulk_error(&items) {
            SinkError::Rejected(e) => assert!(e.contains("mapper_parsing_exception")),
            e => panic!("unexpected {e:?}"),
        }
        assert!(bulk_error(&items[2..]).is_transient());
        assert!(matches!(
            bulk_error(&[]),
            SinkError::Rejected(e) if e == "unknown bulk error"
        ));
    }

    #[tokio::test]
    async fn unreachable_cluster_is_not_ready() {
        let store = Store::new(Arc::new(sink(false)));
        assert!(!store.is_ready(&CancellationToken::new()).await);
        assert!(matches!(
            store.insert(&[record()], &CancellationToken::new()).await,
            Err(SinkError::Unavailable(_))
        ));
    }
}
