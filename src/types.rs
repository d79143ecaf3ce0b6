//! Data model — functions, environments, packages, triggers
//!
//! Entities are identified by `{namespace, name}` everywhere; cross-entity
//! links are references resolved lazily through the declarative store, never
//! in-memory pointers. A `Fingerprint` pins an immutable snapshot of a
//! function by `(uid, resourceVersion)`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Literal archives above this size must live in the blob service so the
/// declarative store stays small.
pub const MAX_LITERAL_ARCHIVE_SIZE: usize = 256 * 1024;

/// Object metadata assigned by the declarative store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Unique id assigned at creation, stable across updates
    #[serde(default)]
    pub uid: String,
    /// Monotonically bumped on every update
    #[serde(default)]
    pub resource_version: String,
}

pub(crate) fn default_namespace() -> String {
    "default".to_string()
}

impl Metadata {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: String::new(),
            resource_version: String::new(),
        }
    }

    /// Fingerprint of this exact snapshot
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            uid: self.uid.clone(),
            resource_version: self.resource_version.clone(),
        }
    }
}

/// `(uid, resourceVersion)` pair uniquely identifying an immutable snapshot.
///
/// Renders as `"<uid>_<resourceVersion>"`; the string form is the cache key
/// and is opaque to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub uid: String,
    pub resource_version: String,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.uid, self.resource_version)
    }
}

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

/// SHA-256 checksum of an archive, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Checksum {
    #[serde(rename = "type", default = "checksum_type")]
    pub kind: String,
    pub sum: String,
}

fn checksum_type() -> String {
    "sha256".to_string()
}

impl Checksum {
    pub fn sha256(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            kind: checksum_type(),
            sum: format!("{:x}", hasher.finalize()),
        }
    }
}

/// Archive contents — inline bytes for small archives, a blob URL otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Archive {
    /// Inline bytes, only permitted below [`MAX_LITERAL_ARCHIVE_SIZE`]
    Literal { literal: Vec<u8> },
    /// Stable blob-service URL plus integrity checksum
    Url { url: String, checksum: Checksum },
}

impl Archive {
    pub fn literal(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Literal {
            literal: bytes.into(),
        }
    }

    pub fn url(url: impl Into<String>, checksum: Checksum) -> Self {
        Self::Url {
            url: url.into(),
            checksum,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Literal { literal } if literal.len() > MAX_LITERAL_ARCHIVE_SIZE => {
                Err(Error::Invalid(format!(
                    "literal archive is {} bytes, limit is {}; upload it to storage instead",
                    literal.len(),
                    MAX_LITERAL_ARCHIVE_SIZE
                )))
            }
            Self::Url { url, .. } if url.is_empty() => {
                Err(Error::Invalid("archive URL is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Language runtime definition shared by many functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub metadata: Metadata,
    pub spec: EnvironmentSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Runtime container image
    pub runtime_image: String,
    /// Builder container image; environments without one cannot build from source
    #[serde(default)]
    pub builder_image: Option<String>,
    /// Default build command when the package does not set one
    #[serde(default)]
    pub build_command: Option<String>,
    /// Warm generic pods kept per environment (pool-based strategy)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Entry-protocol version the runtime implements (selects the
    /// specialize endpoint variant)
    #[serde(default = "default_env_version")]
    pub version: u32,
}

fn default_pool_size() -> u32 {
    3
}

fn default_env_version() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Package
// ---------------------------------------------------------------------------

/// Build status of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    #[default]
    None,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Archive of code bound to an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub metadata: Metadata,
    pub spec: PackageSpec,
    #[serde(default)]
    pub status: PackageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub environment: ObjectRef,
    #[serde(default)]
    pub source: Option<Archive>,
    #[serde(default)]
    pub deployment: Option<Archive>,
    /// Whitespace-split argv; shell metacharacters are not interpreted
    #[serde(default)]
    pub build_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default)]
    pub build_status: BuildStatus,
    #[serde(default)]
    pub build_logs: String,
}

impl Package {
    /// Initial status for a freshly created package: a source archive with no
    /// deploy archive means a build is owed.
    pub fn initial_status(spec: &PackageSpec) -> BuildStatus {
        match (&spec.source, &spec.deployment) {
            (Some(_), None) => BuildStatus::Pending,
            (_, Some(_)) => BuildStatus::Succeeded,
            (None, None) => BuildStatus::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Function
// ---------------------------------------------------------------------------

/// A `{namespace, name}` reference to another entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl ObjectRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// Package reference with the resource-version pinned, so the function keeps
/// running the old artifact until explicitly re-pointed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub resource_version: String,
}

/// Choice between warm-pool tapping and a dedicated autoscaled deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExecutorType {
    #[default]
    PoolBased,
    NewDeployment,
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolBased => write!(f, "pool-based"),
            Self::NewDeployment => write!(f, "new-deployment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeStrategy {
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub min_scale: u32,
    #[serde(default = "default_max_scale")]
    pub max_scale: u32,
    #[serde(default = "default_target_cpu")]
    pub target_cpu_percent: u32,
    /// Seconds to wait for a backend to become ready
    #[serde(default = "default_specialization_timeout")]
    pub specialization_timeout_secs: u64,
}

fn default_max_scale() -> u32 {
    1
}

fn default_target_cpu() -> u32 {
    80
}

fn default_specialization_timeout() -> u64 {
    120
}

impl Default for InvokeStrategy {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::default(),
            min_scale: 0,
            max_scale: default_max_scale(),
            target_cpu_percent: default_target_cpu(),
            specialization_timeout_secs: default_specialization_timeout(),
        }
    }
}

impl InvokeStrategy {
    pub fn validate(&self) -> Result<()> {
        if self.min_scale > self.max_scale {
            return Err(Error::Invalid(format!(
                "minScale {} exceeds maxScale {}",
                self.min_scale, self.max_scale
            )));
        }
        if !(1..=100).contains(&self.target_cpu_percent) {
            return Err(Error::Invalid(format!(
                "targetCPUPercent {} outside [1,100]",
                self.target_cpu_percent
            )));
        }
        Ok(())
    }
}

/// Resource requests/limits in orchestrator units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default)]
    pub cpu_millis: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// A user function: source/binary artifact plus how to run it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub metadata: Metadata,
    pub spec: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub environment: ObjectRef,
    pub package: PackageRef,
    /// Ignored for pool-based functions in favour of the environment's settings
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub secrets: Vec<ObjectRef>,
    #[serde(default)]
    pub config_maps: Vec<ObjectRef>,
    #[serde(default)]
    pub invoke_strategy: InvokeStrategy,
    /// Per-function proxy timeout; default 60s
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
}

fn default_execution_timeout() -> u64 {
    60
}

impl Function {
    pub fn validate(&self) -> Result<()> {
        self.spec.invoke_strategy.validate()?;
        if self.spec.package.namespace != self.metadata.namespace {
            return Err(Error::Invalid(format!(
                "function '{}' references package in namespace '{}'; cross-namespace references are not allowed",
                self.metadata.name, self.spec.package.namespace
            )));
        }
        if self.spec.environment.namespace != self.metadata.namespace {
            return Err(Error::Invalid(format!(
                "function '{}' references environment in namespace '{}'; cross-namespace references are not allowed",
                self.metadata.name, self.spec.environment.namespace
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Function references (triggers → functions)
// ---------------------------------------------------------------------------

/// How a trigger names its target function(s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FunctionReference {
    /// Single function by name
    Name(String),
    /// Canary: percentage weights per function name. Weights are
    /// non-negative integers, at least one positive; the sum is normalised
    /// internally.
    WeightedNames(BTreeMap<String, u32>),
}

impl FunctionReference {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Canonical cache-key form
    pub fn canonical(&self) -> String {
        match self {
            Self::Name(n) => format!("name:{}", n),
            Self::WeightedNames(weights) => {
                // BTreeMap iterates in name order, so this is stable
                let parts: Vec<String> =
                    weights.iter().map(|(n, w)| format!("{}={}", n, w)).collect();
                format!("weighted:{}", parts.join(","))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Name(n) if n.is_empty() => {
                Err(Error::Invalid("function reference name is empty".into()))
            }
            Self::Name(_) => Ok(()),
            Self::WeightedNames(weights) => {
                if weights.is_empty() {
                    return Err(Error::Invalid("weighted reference has no entries".into()));
                }
                if weights.values().all(|w| *w == 0) {
                    return Err(Error::Invalid(
                        "weighted reference needs at least one positive weight".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// HTTP route → function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTrigger {
    pub metadata: Metadata,
    pub spec: HttpTriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTriggerSpec {
    /// Relative URL pattern; a trailing path suffix is passed through to the
    /// function untouched
    pub relative_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Optional exact host rule
    #[serde(default)]
    pub host: Option<String>,
    pub function_reference: FunctionReference,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpTrigger {
    pub fn validate(&self) -> Result<()> {
        if !self.spec.relative_url.starts_with('/') {
            return Err(Error::Invalid(format!(
                "trigger '{}': relativeUrl must start with '/'",
                self.metadata.name
            )));
        }
        self.spec.function_reference.validate()
    }
}

/// Cron schedule → function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTrigger {
    pub metadata: Metadata,
    pub spec: TimeTriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTriggerSpec {
    /// Standard five-field cron expression
    pub cron: String,
    pub function_reference: FunctionReference,
}

impl TimeTrigger {
    pub fn validate(&self) -> Result<()> {
        croner::Cron::new(&self.spec.cron)
            .with_seconds_optional()
            .parse()
            .map_err(|e| {
                Error::Invalid(format!(
                    "trigger '{}': bad cron expression '{}': {}",
                    self.metadata.name, self.spec.cron, e
                ))
            })?;
        self.spec.function_reference.validate()
    }
}

/// Message-queue subscription → function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueueTrigger {
    pub metadata: Metadata,
    pub spec: MessageQueueTriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueueTriggerSpec {
    /// Broker type, e.g. "nats-streaming", "kafka"
    pub queue_type: String,
    pub topic: String,
    #[serde(default)]
    pub response_topic: Option<String>,
    #[serde(default)]
    pub error_topic: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    pub function_reference: FunctionReference,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl MessageQueueTrigger {
    pub fn validate(&self) -> Result<()> {
        if self.spec.topic.is_empty() {
            return Err(Error::Invalid(format!(
                "trigger '{}': topic is empty",
                self.metadata.name
            )));
        }
        self.spec.function_reference.validate()
    }
}

/// Orchestrator watch (namespace + kind + label selector) → function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTrigger {
    pub metadata: Metadata,
    pub spec: WatchTriggerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTriggerSpec {
    pub watch_namespace: String,
    pub kind: String,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    pub function_reference: FunctionReference,
}

impl WatchTrigger {
    pub fn validate(&self) -> Result<()> {
        if self.spec.kind.is_empty() {
            return Err(Error::Invalid(format!(
                "trigger '{}': kind is empty",
                self.metadata.name
            )));
        }
        self.spec.function_reference.validate()
    }
}
