//! ## kafka-injector
//! Service for real-time ingestion of Avro-encoded Kafka messages into a searchable record store.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! health_bind = "0.0.0.0:8080"
//!
//! [ingesters.events]
//! kafka_broker = "localhost:9092"
//! topic = "events"
//! batch_size = 10000
//! batch_timeout_seconds = 10
//! schema_registry_url = "http://localhost:8081"
//! sink = { kind = "elasticsearch", url = "http://localhost:9200", index_prefix = "injector", date_suffix = true }
//!
//! [ingesters.local]
//! kafka_broker = "localhost:9092"
//! topic = "local"
//! schemas = { 7 = "./example.avsc" }       # take schemas from local files instead of registry
//! sink = { kind = "clickhouse", url = "tcp://localhost:9000", table = "local" }
//! ```
//!
//! ## Message processing
//! Every message carries Confluent [envelope]: format marker, schema id and Avro body.
//! Schema id is resolved through [registry], body is decoded by [decoder] into a generic
//! [value::Value] tree, and [record::normalize] turns top-level mapping into a [record::Record]
//! carrying topic, partition, offset and timestamp of the message.
//! [pipeline::Pipeline] runs these steps for single message.
//!
//! ## Kafka and stores
//! [ingester::Ingester] uses Kafka's consumer groups and performs safe offset management ---
//! it will only commit offsets of messages that have been successfully stored.
//! Messages that cannot be decoded are logged and skipped, while registry outages
//! pause ingestion until the message can be decoded.
//!
//! Records are batched and written into [sink::Store]. Batching is controlled by batch size
//! and batch timeout, allowing user to tune ingestion either for throughput or for latency.
//! Readiness of every store is reported by [health] endpoint.

pub mod decoder;
pub mod envelope;
pub mod health;
pub mod ingester;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod settings;
pub mod sink;
pub mod value;
