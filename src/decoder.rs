//! Decodes envelope bodies against schemas from a [SchemaResolver]
pub mod avro;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    registry::{ResolveError, SchemaResolver},
    value::Value,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("resolving schema: {0}")]
    SchemaResolution(#[from] ResolveError),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("decode cancelled")]
    Cancelled,
}

/// Resolves `schema_id` and decodes `body` with the resulting schema.
/// Resolver errors are passed through, nothing is retried here.
pub async fn decode(
    schema_id: u32,
    body: &[u8],
    resolver: &dyn SchemaResolver,
    cancel: &CancellationToken,
) -> Result<Value, DecodeError> {
    let schema = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DecodeError::Cancelled),
        schema = resolver.resolve(schema_id) => schema?,
    };
    avro::decode_body(&schema, body)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apache_avro::{to_avro_datum, types::Value as AvroValue, Schema};
    use async_trait::async_trait;

    use super::*;
    use crate::registry::StaticResolver;

    const SCHEMA: &str = r#"{"name":"x","type":"record","fields":[{"name":"a","type":"int"}]}"#;

    fn resolver() -> StaticResolver {
        StaticResolver::new().with_schema(7, SCHEMA).unwrap()
    }

    fn body(a: i32) -> Vec<u8> {
        let schema = Schema::parse_str(SCHEMA).unwrap();
        to_avro_datum(
            &schema,
            AvroValue::Record(vec![("a".to_string(), AvroValue::Int(a))]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn decodes_registered_schema() {
        let cancel = CancellationToken::new();
        let v = decode(7, &body(42), &resolver(), &cancel).await.unwrap();
        assert_eq!(v, Value::Mapping(vec![(Value::from("a"), Value::Int(42))]));
    }

    #[tokio::test]
    async fn decoding_is_repeatable() {
        let cancel = CancellationToken::new();
        let resolver = resolver();
        let body = body(-5);
        let first = decode(7, &body, &resolver, &cancel).await.unwrap();
        let second = decode(7, &body, &resolver, &cancel).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_schema_is_resolution_error() {
        let cancel = CancellationToken::new();
        assert_eq!(
            decode(999, &body(1), &resolver(), &cancel).await,
            Err(DecodeError::SchemaResolution(ResolveError::NotFound(999)))
        );
    }

    #[tokio::test]
    async fn empty_body_is_malformed() {
        let cancel = CancellationToken::new();
        assert!(matches!(
            decode(7, &[], &resolver(), &cancel).await,
            Err(DecodeError::Malformed(_))
        ));
    }

    struct Hanging;

    #[async_trait]
    impl SchemaResolver for Hanging {
        async fn resolve(&self, _id: u32) -> Result<Arc<Schema>, ResolveError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_resolution() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(
            decode(7, &body(1), &Hanging, &cancel).await,
            Err(DecodeError::Cancelled)
        );
    }
}
