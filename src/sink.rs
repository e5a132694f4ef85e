//! Record stores and the [Store] wrapper the ingester talks to
pub mod clickhouse;
pub mod elasticsearch;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{record::Record, settings};

/// Default bound for a readiness probe
pub const READY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected batch: {0}")]
    Rejected(String),
    #[error("encoding batch: {0}")]
    Encode(String),
    #[error("insert cancelled")]
    Cancelled,
}

impl SinkError {
    /// Whether the same insert may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Concrete record store
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &str;
    /// Checks that a single record can be encoded for this store
    fn validate(&self, _record: &Record) -> Result<(), SinkError> {
        Ok(())
    }
    /// Stores whole batch or fails for all of it
    async fn insert(&self, records: &[Record]) -> Result<(), SinkError>;
    /// Checks that the store accepts writes
    async fn check(&self) -> Result<(), SinkError>;
}

/// Decouples the ingester from concrete store.
/// Inserts are cancellable, readiness is bounded in time and never fails.
#[derive(Clone)]
pub struct Store {
    sink: Arc<dyn RecordSink>,
    ready_timeout: Duration,
}

impl Store {
    pub fn new(sink: Arc<dyn RecordSink>) -> Store {
        Store {
            sink,
            ready_timeout: READY_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Store {
        self.ready_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    pub fn validate(&self, record: &Record) -> Result<(), SinkError> {
        self.sink.validate(record)
    }

    pub async fn insert(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SinkError::Cancelled),
            res = self.sink.insert(records) => res,
        }
    }

    pub async fn is_ready(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            res = tokio::time::timeout(self.ready_timeout, self.sink.check()) => matches!(res, Ok(Ok(()))),
        }
    }
}

/// Creates store described by ingester's sink settings
pub fn from_settings(cfg: &settings::Sink) -> Result<Store, anyhow::Error> {
    let sink: Arc<dyn RecordSink> = match cfg {
        settings::Sink::Elasticsearch {
            url,
            index_prefix,
            date_suffix,
            timeout_seconds,
        } => Arc::new(elasticsearch::ElasticsearchSink::new(
            url,
            index_prefix,
            *date_suffix,
            Duration::from_secs(*timeout_seconds),
        )?),
        settings::Sink::Clickhouse { url, table } => {
            Arc::new(clickhouse::ClickHouseSink::new(url, table))
        }
    };
    Ok(Store::new(sink))
}
