//! Service configuration and wiring.
//!
//! Loaded from a TOML file with every section optional:
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1"
//! port = 8080
//! reconcile_interval_secs = 300
//!
//! [storage]
//! backend = "postgres"          # or "memory"
//! database_url = "postgres://localhost/homecare"
//!
//! [llm]
//! provider = "openai"           # or "keyword"
//!
//! [embedding]
//! provider = "openai"           # "hashing", or "fastembed" with local-embeddings
//! dimension = 1536
//!
//! [memory]
//! update_threshold = 0.85
//! ```
//!
//! On Unix the file must not be world-writable, and must not be
//! world-readable when it holds an API key.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use homecare_common::{Embedder, MemoryRepository, VectorIndex};
use homecare_llm::{build_extractor, build_openai_embedder, EmbeddingConfig, LlmConfig};
use homecare_memory::{
    connect, HashingEmbedder, InMemoryRepository, InMemoryVectorIndex, MemoryConfig,
    MemoryCoordinator, PgVectorIndex, PostgresRepository,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Background repair period, 0 disables it
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Age after which an uncommitted row is considered abandoned
    #[serde(default = "default_pending_grace")]
    pub pending_grace_secs: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_pending_grace() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            cors_origins: Vec::new(),
            reconcile_interval_secs: default_reconcile_interval(),
            pending_grace_secs: default_pending_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "memory" or "postgres"
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Falls back to DATABASE_URL when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    pub fn resolve_database_url(&self) -> Option<String> {
        self.database_url
            .clone()
            .filter(|url| !url.is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

impl ServiceConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;

        if config.llm.api_key.is_some() || config.embedding.api_key.is_some() {
            warn!(
                "API key found in config file '{}'. Prefer the OPENAI_API_KEY environment variable.",
                path.display()
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.memory.validate()?;
        if self.embedding.dimension != self.memory.embedding_dimension {
            bail!(
                "embedding.dimension ({}) and memory.embedding_dimension ({}) must match",
                self.embedding.dimension,
                self.memory.embedding_dimension
            );
        }
        match self.storage.backend.as_str() {
            "memory" | "postgres" => Ok(()),
            other => bail!("Unknown storage backend '{other}', expected 'memory' or 'postgres'"),
        }
    }
}

/// Rejects non-regular and world-writable files, and world-readable files
/// that look like they contain an API key.
#[cfg(unix)]
fn validate_config_file_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

    if !metadata.is_file() {
        bail!(
            "Config path '{}' is not a regular file. Symlinks and directories are not allowed.",
            path.display()
        );
    }

    let permission_bits = metadata.permissions().mode() & 0o777;

    if permission_bits & 0o002 != 0 {
        bail!(
            "Config file '{}' is world-writable (mode {:04o}). Fix with: chmod o-w {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    let content = std::fs::read_to_string(path).unwrap_or_default();
    let has_api_key = content.contains("api_key")
        && (content.contains("sk-") || content.contains("key ="));

    if has_api_key && permission_bits & 0o004 != 0 {
        bail!(
            "Config file '{}' contains an API key but is world-readable (mode {:04o}). \
             Fix with: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    if has_api_key && permission_bits & 0o040 != 0 {
        warn!(
            "Config file '{}' contains an API key and is group-readable (mode {:04o}). \
             Consider: chmod 600 {}",
            path.display(),
            permission_bits,
            path.display()
        );
    }

    Ok(())
}

async fn build_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(build_openai_embedder(config)?)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimension)?)),
        #[cfg(feature = "local-embeddings")]
        "fastembed" => {
            let embedder = homecare_memory::FastEmbedder::from_config(&config.model, config.dimension)?;
            embedder.warmup().await?;
            Ok(Arc::new(embedder))
        }
        #[cfg(not(feature = "local-embeddings"))]
        "fastembed" => bail!("Embedding provider 'fastembed' requires the local-embeddings feature"),
        other => bail!("Unknown embedding provider '{other}'"),
    }
}

async fn build_stores(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<dyn MemoryRepository>, Arc<dyn VectorIndex>)> {
    if config.storage.backend != "postgres" {
        info!("Using in-memory storage; memories are lost on restart");
        return Ok((
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryVectorIndex::new()),
        ));
    }

    let url = config
        .storage
        .resolve_database_url()
        .context("storage.backend is 'postgres' but no database_url or DATABASE_URL is set")?;
    let pool = connect(&url, config.storage.max_connections).await?;

    let repository = PostgresRepository::new(pool.clone());
    repository.ensure_schema().await?;
    let index = PgVectorIndex::new(pool, config.memory.embedding_dimension);
    index.ensure_schema().await?;

    info!("Using PostgreSQL storage with pgvector index");
    Ok((Arc::new(repository), Arc::new(index)))
}

/// Build the coordinator and its collaborators from configuration.
pub async fn build_coordinator(config: &ServiceConfig) -> anyhow::Result<MemoryCoordinator> {
    config.validate()?;
    let extractor = build_extractor(&config.llm)?;
    let embedder = build_embedder(&config.embedding).await?;
    let (repository, index) = build_stores(config).await?;

    Ok(MemoryCoordinator::new(
        config.memory.clone(),
        extractor,
        embedder,
        repository,
        index,
    )?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::NamedTempFile;

    fn write_config(content: &str, mode: u32) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode)).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.storage.backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
[server]
port = 9090

[llm]
provider = "keyword"

[embedding]
provider = "hashing"
dimension = 256

[memory]
embedding_dimension = 256
update_threshold = 0.9
"#,
            0o600,
        );
        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.reconcile_interval_secs, 300);
        assert_eq!(config.llm.provider, "keyword");
        assert_eq!(config.embedding.dimension, 256);
        assert!((config.memory.update_threshold - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let file = write_config(
            r#"
[embedding]
dimension = 384
"#,
            0o600,
        );
        let err = ServiceConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let config = ServiceConfig {
            storage: StorageConfig {
                backend: "sqlite".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_world_writable_rejected() {
        let file = write_config("[server]\nport = 1\n", 0o666);
        let err = ServiceConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("world-writable"));
    }

    #[test]
    fn test_world_readable_api_key_rejected() {
        let file = write_config("[llm]\napi_key = \"sk-test\"\n", 0o644);
        let err = ServiceConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("world-readable"));

        let file = write_config("[llm]\napi_key = \"sk-test\"\n", 0o600);
        assert!(ServiceConfig::from_file(file.path()).is_ok());
    }

    #[tokio::test]
    async fn test_build_offline_coordinator() {
        let mut config = ServiceConfig::default();
        config.llm.provider = "keyword".to_string();
        config.embedding.provider = "hashing".to_string();
        config.embedding.dimension = 64;
        config.memory.embedding_dimension = 64;

        let coordinator = build_coordinator(&config).await.unwrap();
        assert_eq!(coordinator.config().embedding_dimension, 64);
    }

    #[tokio::test]
    async fn test_postgres_backend_requires_url() {
        let mut config = ServiceConfig::default();
        config.llm.provider = "keyword".to_string();
        config.embedding.provider = "hashing".to_string();
        config.storage.backend = "postgres".to_string();
        config.storage.database_url = Some(String::new());
        if std::env::var("DATABASE_URL").is_ok() {
            return;
        }
        assert!(build_coordinator(&config).await.is_err());
    }
}
