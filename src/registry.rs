//! Schema resolution: schema id -> parsed Avro schema
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use apache_avro::Schema;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};

use crate::settings;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("schema {0} not found")]
    NotFound(u32),
    #[error("schema registry unavailable: {0}")]
    Transport(String),
    #[error("schema {id} is unusable: {reason}")]
    InvalidSchema { id: u32, reason: String },
}

/// Resolves schema identifiers found in message envelopes
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn resolve(&self, id: u32) -> Result<Arc<Schema>, ResolveError>;
}

#[async_trait]
impl<T: SchemaResolver + ?Sized> SchemaResolver for Arc<T> {
    async fn resolve(&self, id: u32) -> Result<Arc<Schema>, ResolveError> {
        (**self).resolve(id).await
    }
}

/// Fixed set of schemas known upfront
#[derive(Default, Clone)]
pub struct StaticResolver {
    schemas: HashMap<u32, Arc<Schema>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        StaticResolver::default()
    }

    pub fn with_schema(mut self, id: u32, schema: &str) -> Result<Self, apache_avro::Error> {
        self.schemas.insert(id, Arc::new(Schema::parse_str(schema)?));
        Ok(self)
    }

    /// Loads `.avsc` files, keyed by schema id
    pub fn from_files<P: AsRef<Path>>(files: &HashMap<u32, P>) -> Result<Self, anyhow::Error> {
        let mut resolver = StaticResolver::new();
        for (id, path) in files {
            let path = path.as_ref();
            let schema = std::fs::read_to_string(path)
                .with_context(|| format!("reading schema {id} from {}", path.display()))?;
            resolver = resolver
                .with_schema(*id, &schema)
                .with_context(|| format!("parsing schema {id} from {}", path.display()))?;
        }
        Ok(resolver)
    }
}

#[async_trait]
impl SchemaResolver for StaticResolver {
    async fn resolve(&self, id: u32) -> Result<Arc<Schema>, ResolveError> {
        self.schemas
            .get(&id)
            .cloned()
            .ok_or(ResolveError::NotFound(id))
    }
}

#[derive(Deserialize)]
struct RegistrySchema {
    schema: String,
    #[serde(rename = "schemaType")]
    schema_type: Option<String>,
}

/// Client for Confluent-compatible schema registry
pub struct RegistryResolver {
    client: reqwest::Client,
    url: String,
}

impl RegistryResolver {
    pub fn new(url: &str, timeout: Duration) -> Result<RegistryResolver, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building schema registry client")?;
        Ok(RegistryResolver {
            client,
            url: url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl SchemaResolver for RegistryResolver {
    async fn resolve(&self, id: u32) -> Result<Arc<Schema>, ResolveError> {
        let transport = |e: reqwest::Error| ResolveError::Transport(e.to_string());
        let resp = self
            .client
            .get(format!("{}/schemas/ids/{}", self.url, id))
            .send()
            .await
            .map_err(transport)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(id));
        }
        let body: RegistrySchema = resp
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;
        match body.schema_type.as_deref() {
            None | Some("AVRO") => {}
            Some(other) => {
                return Err(ResolveError::InvalidSchema {
                    id,
                    reason: format!("unsupported schema type {other}"),
                })
            }
        }
        Schema::parse_str(&body.schema)
            .map(Arc::new)
            .map_err(|e| ResolveError::InvalidSchema {
                id,
                reason: e.to_string(),
            })
    }
}

/// Caches schemas resolved by the inner resolver.
/// Concurrent lookups of the same id share one fetch; failures are not cached.
pub struct CachedResolver<R> {
    inner: R,
    cache: RwLock<HashMap<u32, Arc<OnceCell<Arc<Schema>>>>>,
}

impl<R: SchemaResolver> CachedResolver<R> {
    pub fn new(inner: R) -> CachedResolver<R> {
        CachedResolver {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cell(&self, id: u32) -> Arc<OnceCell<Arc<Schema>>> {
        if let Some(cell) = self.cache.read().await.get(&id) {
            return cell.clone();
        }
        self.cache.write().await.entry(id).or_default().clone()
    }
}

#[async_trait]
impl<R: SchemaResolver> SchemaResolver for CachedResolver<R> {
    async fn resolve(&self, id: u32) -> Result<Arc<Schema>, ResolveError> {
        let cell = self.cell(id).await;
        let res = cell
            .get_or_try_init(|| self.inner.resolve(id))
            .await
            .cloned();
        if res.is_err() {
            let mut cache = self.cache.write().await;
            if cache
                .get(&id)
                .is_some_and(|c| Arc::ptr_eq(c, &cell) && !c.initialized())
            {
                cache.remove(&id);
            }
        }
        res
    }
}

/// Creates resolver for ingester: cached registry client, or local schema files.
pub fn from_settings(cfg: &settings::Ingester) -> Result<Arc<dyn SchemaResolver>, anyhow::Error> {
    match &cfg.schema_registry_url {
        Some(url) => {
            let timeout = Duration::from_secs(cfg.registry_timeout_seconds.unwrap_or(5));
            Ok(Arc::new(CachedResolver::new(RegistryResolver::new(url, timeout)?)))
        }
        None => Ok(Arc::new(StaticResolver::from_files(&cfg.schema_files()?)?)),
    }
}
