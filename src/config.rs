//! Process configuration.
//!
//! Uses HCL (HashiCorp Configuration Language) as the configuration format.
//!
//! # HCL Example
//!
//! ```hcl
//! listen {
//!   router  = "0.0.0.0:8888"
//!   builder = "0.0.0.0:8001"
//! }
//!
//! namespaces {
//!   default = "default"
//!   runtime = "funcgate-fn"
//!   builder = "funcgate-builder"
//! }
//!
//! pool {
//!   size              = 3
//!   max_queue         = 128
//!   idle_timeout_secs = 120
//! }
//!
//! timeouts {
//!   specialization_secs = 120
//!   execution_secs      = 60
//!   lock_secs           = 120
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub namespaces: NamespaceConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Listener addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_router_addr")]
    pub router: String,

    #[serde(default = "default_builder_addr")]
    pub builder: String,
}

/// Namespace placement for user-facing objects and managed workloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace assumed when a request names none
    #[serde(default = "default_default_namespace")]
    pub default: String,

    /// Namespace function pods and deployments run in
    #[serde(default = "default_runtime_namespace")]
    pub runtime: String,

    /// Namespace builder workloads run in
    #[serde(default = "default_builder_namespace")]
    pub builder: String,
}

/// Warm-pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Warm generic pods kept per environment when the environment does not
    /// set its own size
    #[serde(default = "default_pool_size")]
    pub size: u32,

    /// Acquire requests allowed to queue per environment before overload
    /// rejection
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,

    /// Specialized pods unused for this long are reclaimed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Operation deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for turning a generic pod into a function backend
    #[serde(default = "default_specialization_timeout")]
    pub specialization_secs: u64,

    /// Default per-request execution deadline when the function sets none
    #[serde(default = "default_execution_timeout")]
    pub execution_secs: u64,

    /// How long a dispatch waits on another request's in-flight
    /// specialization. Must cover the specialization deadline, otherwise
    /// waiters give up on work that is still going to succeed.
    #[serde(default = "default_lock_timeout")]
    pub lock_secs: u64,

    /// Advisory build lease lifetime
    #[serde(default = "default_build_lease")]
    pub build_lease_secs: u64,

    /// Resolver cache entry lifetime
    #[serde(default = "default_resolver_ttl")]
    pub resolver_ttl_secs: u64,
}

/// Archive storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the archive storage service; unset selects the in-memory
    /// store (single-process mode)
    #[serde(default)]
    pub url: Option<String>,

    /// Volume shared between the build manager and builder pods
    #[serde(default = "default_shared_volume")]
    pub shared_volume: String,
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_router_addr() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_builder_addr() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_default_namespace() -> String {
    "default".to_string()
}

fn default_runtime_namespace() -> String {
    "funcgate-fn".to_string()
}

fn default_builder_namespace() -> String {
    "funcgate-builder".to_string()
}

fn default_pool_size() -> u32 {
    3
}

fn default_max_queue() -> u32 {
    128
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_specialization_timeout() -> u64 {
    120
}

fn default_execution_timeout() -> u64 {
    60
}

fn default_lock_timeout() -> u64 {
    120
}

fn default_build_lease() -> u64 {
    600
}

fn default_resolver_ttl() -> u64 {
    6
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            router: default_router_addr(),
            builder: default_builder_addr(),
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            default: default_default_namespace(),
            runtime: default_runtime_namespace(),
            builder: default_builder_namespace(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_queue: default_max_queue(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            specialization_secs: default_specialization_timeout(),
            execution_secs: default_execution_timeout(),
            lock_secs: default_lock_timeout(),
            build_lease_secs: default_build_lease(),
            resolver_ttl_secs: default_resolver_ttl(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            shared_volume: default_shared_volume(),
        }
    }
}

fn default_shared_volume() -> String {
    "/userfunc".to_string()
}

impl Config {
    /// Load configuration from an HCL file.
    ///
    /// The file must contain valid HCL content regardless of extension.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen
            .router
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Bad router address: {}", e)))?;
        self.listen
            .builder
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Bad builder address: {}", e)))?;

        if self.pool.size == 0 {
            return Err(Error::Config("pool.size must be at least 1".into()));
        }
        if self.timeouts.lock_secs < self.timeouts.specialization_secs {
            return Err(Error::Config(format!(
                "timeouts.lock_secs ({}) must cover timeouts.specialization_secs ({})",
                self.timeouts.lock_secs, self.timeouts.specialization_secs
            )));
        }
        if let Some(url) = &self.storage.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config(format!("Bad storage URL '{}'", url)));
            }
        }
        Ok(())
    }

    pub fn router_addr(&self) -> Result<SocketAddr> {
        self.listen
            .router
            .parse()
            .map_err(|e| Error::Config(format!("Bad router address: {}", e)))
    }

    pub fn builder_addr(&self) -> Result<SocketAddr> {
        self.listen
            .builder
            .parse()
            .map_err(|e| Error::Config(format!("Bad builder address: {}", e)))
    }

    pub fn specialization_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.specialization_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.execution_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.lock_secs)
    }

    pub fn build_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.build_lease_secs)
    }

    pub fn resolver_ttl(&self) -> Duration {
        Duration::from_secs(self.timeouts.resolver_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen.router, "0.0.0.0:8888");
        assert_eq!(config.namespaces.runtime, "funcgate-fn");
        assert_eq!(config.pool.size, 3);
    }

    #[test]
    fn test_parse_hcl() {
        let hcl = r#"
            listen {
              router  = "127.0.0.1:9000"
              builder = "127.0.0.1:9001"
            }

            pool {
              size      = 5
              max_queue = 64
            }

            timeouts {
              specialization_secs = 90
              lock_secs           = 100
            }

            storage {
              url = "http://storage:8000"
            }
        "#;
        let config = Config::from_hcl(hcl).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.router, "127.0.0.1:9000");
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.pool.idle_timeout_secs, 120);
        assert_eq!(config.timeouts.specialization_secs, 90);
        assert_eq!(config.storage.url.as_deref(), Some("http://storage:8000"));
    }

    #[test]
    fn test_lock_timeout_must_cover_specialization() {
        let mut config = Config::default();
        config.timeouts.lock_secs = 10;
        config.timeouts.specialization_secs = 120;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock_secs"));
    }

    #[test]
    fn test_bad_address_is_rejected() {
        let mut config = Config::default();
        config.listen.router = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_storage_url_is_rejected() {
        let mut config = Config::default();
        config.storage.url = Some("ftp://nope".into());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funcgate.hcl");
        std::fs::write(&path, "pool {\n  size = 7\n}\n").unwrap();
        let config = Config::from_file(&path).await.unwrap();
        assert_eq!(config.pool.size, 7);
    }
}
