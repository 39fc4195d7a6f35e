//! Server configuration file
//!
//! Optional JSON file holding the storage settings plus the archive tiers to
//! put behind the local disk:
//!
//! ```json
//! {
//!   "storage": { "root_dir": "/var/lib/framehouse", "max_cost_per_month": 5.0 },
//!   "archives": [
//!     { "prefix": "camera-1", "class": "warm", "backend": { "type": "local", "path": "/mnt/nas" } },
//!     { "prefix": "camera-1", "class": "cold", "backend": { "type": "s3", "bucket": "footage" } }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use framehouse_storage::{ObjectStoreTierFactory, ObjectTierClass, StorageConfig};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote tiers, tried in the order given before cost sorting
    #[serde(default)]
    pub archives: Vec<ArchiveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Key prefix inside the backend
    pub prefix: String,
    pub class: ObjectTierClass,
    pub backend: ArchiveBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArchiveBackend {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Lost on exit
    Memory,
}

impl ServerConfig {
    /// Load from `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: ServerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

impl ArchiveBackend {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self {
            ArchiveBackend::Local { path } => {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("creating archive directory {}", path.display()))?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            ArchiveBackend::S3 {
                bucket,
                region,
                endpoint,
            } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                Arc::new(builder.build()?)
            }
            ArchiveBackend::Memory => Arc::new(InMemory::new()),
        };
        Ok(store)
    }
}

impl ArchiveConfig {
    pub fn factory(&self) -> Result<ObjectStoreTierFactory> {
        Ok(ObjectStoreTierFactory::new(
            self.backend.build()?,
            self.prefix.clone(),
            self.class,
        ))
    }
}
