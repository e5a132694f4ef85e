//! Per-message transformation: envelope -> decoded value -> record
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rdkafka::message::{Message, Timestamp};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    decoder::{self, DecodeError},
    envelope::{parse_envelope, parse_envelope_strict, EnvelopeError},
    record::{normalize, NormalizeError, Record},
    registry::{ResolveError, SchemaResolver},
};

/// Message as delivered by the log
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Copies message out of consumer buffer.
    /// Missing payload becomes empty, missing timestamp becomes unix epoch.
    pub fn from_kafka<M: Message>(msg: &M) -> RawMessage {
        let timestamp = match msg.timestamp() {
            Timestamp::CreateTime(ms) | Timestamp::LogAppendTime(ms) => {
                DateTime::from_timestamp_millis(ms)
            }
            Timestamp::NotAvailable => None,
        };
        RawMessage {
            topic: msg.topic().to_owned(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: timestamp.unwrap_or(DateTime::UNIX_EPOCH),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),
}

impl PipelineError {
    /// Whether the message itself is bad, so that skipping it loses nothing that a retry would fix
    pub fn is_skippable(&self) -> bool {
        match self {
            PipelineError::Envelope(_) | PipelineError::Normalize(_) => true,
            PipelineError::Decode(DecodeError::Malformed(_)) => true,
            PipelineError::Decode(DecodeError::SchemaResolution(e)) => match e {
                ResolveError::NotFound(_) | ResolveError::InvalidSchema { .. } => true,
                ResolveError::Transport(_) => false,
            },
            PipelineError::Decode(DecodeError::Cancelled) => false,
        }
    }
}

/// Stateless apart from the shared resolver, safe to use from many tasks
#[derive(Clone)]
pub struct Pipeline {
    resolver: Arc<dyn SchemaResolver>,
    strict_marker: bool,
}

impl Pipeline {
    pub fn new(resolver: Arc<dyn SchemaResolver>) -> Pipeline {
        Pipeline {
            resolver,
            strict_marker: false,
        }
    }

    /// Reject payloads whose format marker is not zero
    pub fn strict_marker(mut self, strict: bool) -> Pipeline {
        self.strict_marker = strict;
        self
    }

    pub async fn process(
        &self,
        msg: &RawMessage,
        cancel: &CancellationToken,
    ) -> Result<Record, PipelineError> {
        let envelope = match self.strict_marker {
            true => parse_envelope_strict(&msg.payload)?,
            false => parse_envelope(&msg.payload)?,
        };
        let decoded =
            decoder::decode(envelope.schema_id, envelope.body, self.resolver.as_ref(), cancel)
                .await?;
        Ok(normalize(
            decoded,
            &msg.topic,
            msg.partition,
            msg.offset,
            msg.timestamp,
        )?)
    }
}
