//! Application config
use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, File};
use serde::Deserialize;

/// Record store an ingester writes to
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Sink {
    Elasticsearch {
        /// URL of Elasticsearch
        url: String,
        /// index name prefix, topic name is appended to it
        index_prefix: String,
        /// append `-YYYY-MM-DD` of message timestamp to index name (default: false)
        #[serde(default)]
        date_suffix: bool,
        /// request timeout (default: 30s)
        #[serde(default = "default_es_timeout")]
        timeout_seconds: u64,
    },
    Clickhouse {
        /// URL of ClickHouse
        url: String,
        /// ClickHouse table to ingest into
        table: String,
    },
}

fn default_es_timeout() -> u64 {
    30
}

/// configuration of single topic ingester
#[derive(Deserialize, Debug, Clone)]
pub struct Ingester {
    /// address of bootstrap kafka broker
    pub kafka_broker: String,
    /// topic to ingest
    pub topic: String,
    /// consumer group to use (default: use ingester's name)
    pub consumer_group: Option<String>,
    /// max insert batch size (default: 1000)
    pub batch_size: Option<usize>,
    /// batching timeout (default: 10s)
    pub batch_timeout_seconds: Option<u64>,
    /// pause between failed insert attempts (default: 1000ms)
    pub insert_backoff_ms: Option<u64>,
    /// fail messages whose format marker is not zero (default: false)
    #[serde(default)]
    pub strict_marker: bool,
    /// URL of schema registry
    pub schema_registry_url: Option<String>,
    /// schema registry request timeout (default: 5s)
    pub registry_timeout_seconds: Option<u64>,
    /// local schema files by schema id, used instead of registry
    pub schemas: Option<HashMap<String, PathBuf>>,
    /// where records go
    pub sink: Sink,
}

impl Ingester {
    /// Local schema files keyed by numeric schema id
    pub fn schema_files(&self) -> Result<HashMap<u32, PathBuf>, ConfigError> {
        let mut files = HashMap::new();
        for (id, path) in self.schemas.iter().flatten() {
            let id: u32 = id
                .parse()
                .map_err(|_| ConfigError::Message(format!("invalid schema id {id:?}")))?;
            files.insert(id, path.to_owned());
        }
        Ok(files)
    }
}

#[derive(Deserialize, Debug)]
pub struct Settings {
    /// address of readiness endpoint (default: 0.0.0.0:8080)
    pub health_bind: Option<String>,
    /// Map of ingester names and settings
    pub ingesters: HashMap<String, Ingester>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .build()?;
        Settings::from_config(cfg)
    }

    fn from_config(cfg: Config) -> Result<Self, ConfigError> {
        let mut settings: Settings = cfg.try_deserialize()?;
        settings.health_bind.get_or_insert_with(|| String::from("0.0.0.0:8080"));
        for (name, cfg) in &mut settings.ingesters {
            cfg.batch_size.get_or_insert(1000);
            cfg.batch_timeout_seconds.get_or_insert(10);
            cfg.insert_backoff_ms.get_or_insert(1000);
            cfg.registry_timeout_seconds.get_or_insert(5);
            cfg.consumer_group.get_or_insert_with(|| name.to_owned());
            if cfg.batch_size == Some(0) {
                return Err(ConfigError::Message(format!(
                    "ingester {name}: batch_size must be positive"
                )));
            }
            match (&cfg.schema_registry_url, &cfg.schemas) {
                (None, None) => {
                    return Err(ConfigError::Message(format!(
                        "ingester {name}: either schema_registry_url or schemas is required"
                    )))
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Message(format!(
                        "ingester {name}: schema_registry_url and schemas are exclusive"
                    )))
                }
                _ => {}
            }
            cfg.schema_files()
                .map_err(|e| ConfigError::Message(format!("ingester {name}: {e}")))?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn parse(toml: &str) -> Result<Settings, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Settings::from_config(cfg)
    }

    #[test]
    fn fills_defaults() {
        let settings = parse(
            r#"
[ingesters.events]
kafka_broker = "localhost:9092"
topic = "events"
schema_registry_url = "http://localhost:8081"
sink = { kind = "elasticsearch", url = "http://localhost:9200", index_prefix = "injector" }
"#,
        )
        .unwrap();
        assert_eq!(settings.health_bind.as_deref(), Some("0.0.0.0:8080"));
        let cfg = &settings.ingesters["events"];
        assert_eq!(cfg.consumer_group.as_deref(), Some("events"));
        assert_eq!(cfg.batch_size, Some(1000));
        assert_eq!(cfg.batch_timeout_seconds, Some(10));
        assert_eq!(cfg.insert_backoff_ms, Some(1000));
        assert_eq!(cfg.registry_timeout_seconds, Some(5));
        assert!(!cfg.strict_marker);
        assert_eq!(
            cfg.sink,
            Sink::Elasticsearch {
                url: String::from("http://localhost:9200"),
                index_prefix: String::from("injector"),
                date_suffix: false,
                timeout_seconds: 30,
            }
        );
    }

    #[test]
    fn local_schemas_and_clickhouse() {
        let settings = parse(
            r#"
[ingesters.events]
kafka_broker = "localhost:9092"
topic = "events"
consumer_group = "group"
batch_size = 10
strict_marker = true
schemas = { 7 = "./schemas/x.avsc" }
sink = { kind = "clickhouse", url = "tcp://localhost:9000", table = "events" }
"#,
        )
        .unwrap();
        let cfg = &settings.ingesters["events"];
        assert_eq!(cfg.consumer_group.as_deref(), Some("group"));
        assert_eq!(cfg.batch_size, Some(10));
        assert!(cfg.strict_marker);
        assert_eq!(
            cfg.schema_files().unwrap()[&7],
            PathBuf::from("./schemas/x.avsc")
        );
        assert!(matches!(cfg.sink, Sink::Clickhouse { .. }));
    }

    #[test]
    fn rejects_non_numeric_schema_ids() {
        let err = parse(
            r#"
[ingesters.events]
kafka_broker = "localhost:9092"
topic = "events"
schemas = { seven = "./x.avsc" }
sink = { kind = "clickhouse", url = "tcp://localhost:9000", table = "events" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid schema id"));
    }

    #[test]
    fn requires_schema_source() {
        let err = parse(
            r#"
[ingesters.events]
kafka_broker = "localhost:9092"
topic = "events"
sink = { kind = "clickhouse", url = "tcp://localhost:9000", table = "events" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("schema_registry_url"));
    }
}
