//! Fleet configuration from YAML

use crate::core::error::{ConfigError, ValidationError};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use regex::Regex;
use tracing::{debug, warn};

pub const DEFAULT_FLEET_NAME: &str = "mimir";
pub const DEFAULT_ARTIFACT_BUCKET: &str = "codepipeline-mimir-cicd";
pub const DEFAULT_REGISTRY_PREFIX: &str = "mimir";
pub const DEFAULT_REGION: &str = "ap-northeast-2";
pub const DEFAULT_PUBLIC_DOMAIN: &str = "example.com";
pub const DEFAULT_BUILD_SPEC_PATH: &str = "buildspec.yml";

const DEFAULT_CPU: u64 = 256;
const DEFAULT_MEMORY: u64 = 512;
const DEFAULT_DESIRED_COUNT: u64 = 1;

const SERVICE_KEYS: &[&str] = &["name", "port", "cpu", "memory", "desiredCount", "secrets", "publicLb"];

fn service_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,39}$").expect("valid service name regex"))
}

fn dns_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid dns label regex"))
}

/// Top-level fleet configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Prefix for fleet-wide resources (cluster, log streams)
    pub fleet_name: String,

    /// Shared object-storage bucket holding every service's artifacts
    pub artifact_bucket: String,

    /// Registry namespace; repositories are `{prefix}/{service}`
    pub registry_prefix: String,

    pub region: String,

    /// Domain under which public entry points are exposed
    pub public_domain: String,

    /// Location of the opaque build instructions
    pub build_spec_path: String,

    /// Orchestrator timing knobs
    pub pipeline: PipelineSettings,

    /// One entry per service, in file order
    #[serde(rename = "ecsServices")]
    pub services: Vec<ServiceSpec>,
}

/// A single service of the fleet, fully defaulted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    pub cpu: u32,
    pub memory: u32,
    pub desired_count: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_lb: Option<PublicExposure>,
}

impl ServiceSpec {
    /// Build a spec with default sizing, mostly useful in tests
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            cpu: DEFAULT_CPU as u32,
            memory: DEFAULT_MEMORY as u32,
            desired_count: DEFAULT_DESIRED_COUNT as u32,
            secrets: Vec::new(),
            public_lb: None,
        }
    }
}

/// Named reference to a secret injected into the service's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

/// Public exposure request for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicExposure {
    pub domain_head: String,
}

/// Timing and retry settings shared by every pipeline of the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub source_retry: SourceRetrySettings,

    /// Upper bound on a single build, in seconds
    pub build_timeout_secs: u64,

    /// Upper bound on rollout stabilization, in seconds
    pub rollout_timeout_secs: u64,

    /// Delay between build/rollout status polls
    pub poll_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source_retry: SourceRetrySettings::default(),
            build_timeout_secs: 3600,
            rollout_timeout_secs: 1800,
            poll_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SourceRetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SourceRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            fleet_name: DEFAULT_FLEET_NAME.to_string(),
            artifact_bucket: DEFAULT_ARTIFACT_BUCKET.to_string(),
            registry_prefix: DEFAULT_REGISTRY_PREFIX.to_string(),
            region: DEFAULT_REGION.to_string(),
            public_domain: DEFAULT_PUBLIC_DOMAIN.to_string(),
            build_spec_path: DEFAULT_BUILD_SPEC_PATH.to_string(),
            pipeline: PipelineSettings::default(),
            services: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Load the fleet configuration from a YAML file.
    ///
    /// An absent file is an empty fleet. Unreadable or malformed files are
    /// errors.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("No configuration at {}, using an empty fleet", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate the fleet configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_yaml::from_str(yaml)?;
        Ok(Self::from_value(&document)?)
    }

    /// Validate an already-parsed YAML document.
    ///
    /// Service entries are walked as raw `Value`s rather than derived so every
    /// error can name the entry (`ecsServices[1] (api)`) and the offending
    /// field. The settings sections have no such labels and use derive.
    pub fn from_value(document: &Value) -> Result<Self, ValidationError> {
        let root = match document {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(map) => map,
            _ => return Err(ValidationError::new("config", "<root>", "must be a mapping")),
        };

        let defaults = Self::default();
        let mut config = Self {
            fleet_name: optional_string(root, "fleetName", "config")?.unwrap_or(defaults.fleet_name),
            artifact_bucket: optional_string(root, "artifactBucket", "config")?
                .unwrap_or(defaults.artifact_bucket),
            registry_prefix: optional_string(root, "registryPrefix", "config")?
                .unwrap_or(defaults.registry_prefix),
            region: optional_string(root, "region", "config")?.unwrap_or(defaults.region),
            public_domain: optional_string(root, "publicDomain", "config")?
                .unwrap_or(defaults.public_domain),
            build_spec_path: optional_string(root, "buildSpecPath", "config")?
                .unwrap_or(defaults.build_spec_path),
            pipeline: parse_pipeline_settings(root)?,
            services: Vec::new(),
        };

        let entries = match root.get("ecsServices") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(entries)) => entries.clone(),
            Some(_) => return Err(ValidationError::new("config", "ecsServices", "must be a list")),
        };

        let mut seen: HashMap<String, usize> = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            let service = parse_service(index, entry)?;
            if let Some(first) = seen.get(&service.name) {
                return Err(ValidationError::new(
                    format!("ecsServices[{}] ({})", index, service.name),
                    "name",
                    format!("duplicates ecsServices[{}]", first),
                ));
            }
            seen.insert(service.name.clone(), index);
            config.services.push(service);
        }

        debug!("Loaded {} service(s) for fleet {}", config.services.len(), config.fleet_name);
        Ok(config)
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Where the build specification lives; relative paths are resolved
    /// against the directory of the configuration file
    pub fn build_spec_location(&self, config_file: &Path) -> PathBuf {
        let configured = Path::new(&self.build_spec_path);
        if configured.is_absolute() {
            return configured.to_path_buf();
        }
        config_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(configured)
    }
}

fn parse_pipeline_settings(root: &Mapping) -> Result<PipelineSettings, ValidationError> {
    let settings: PipelineSettings = match root.get("pipeline") {
        None | Some(Value::Null) => PipelineSettings::default(),
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|e| ValidationError::new("config", "pipeline", e.to_string()))?,
    };

    if settings.source_retry.max_attempts == 0 {
        return Err(ValidationError::new(
            "config",
            "pipeline.sourceRetry.maxAttempts",
            "must be at least 1",
        ));
    }
    if settings.source_retry.max_backoff_ms < settings.source_retry.initial_backoff_ms {
        return Err(ValidationError::new(
            "config",
            "pipeline.sourceRetry.maxBackoffMs",
            "must not be smaller than initialBackoffMs",
        ));
    }
    for (field, value) in [
        ("pipeline.buildTimeoutSecs", settings.build_timeout_secs),
        ("pipeline.rolloutTimeoutSecs", settings.rollout_timeout_secs),
        ("pipeline.pollIntervalMs", settings.poll_interval_ms),
    ] {
        if value == 0 {
            return Err(ValidationError::new("config", field, "must be positive"));
        }
    }

    Ok(settings)
}

fn parse_service(index: usize, entry: &Value) -> Result<ServiceSpec, ValidationError> {
    let mut label = format!("ecsServices[{}]", index);
    let map = entry
        .as_mapping()
        .ok_or_else(|| ValidationError::new(&label, "<entry>", "must be a mapping"))?;

    let name = required_string(map, "name", &label)?;
    if !service_name_pattern().is_match(&name) {
        return Err(ValidationError::new(
            &label,
            "name",
            format!(
                "'{}' must be 1-40 characters of letters, digits or '-', starting with a letter or digit",
                name
            ),
        ));
    }
    label = format!("{} ({})", label, name);

    for key in map.keys() {
        match key.as_str() {
            Some(k) if SERVICE_KEYS.contains(&k) => {}
            _ => warn!("{}: ignoring unknown field {:?}", label, key),
        }
    }

    let port = positive_int(map, "port", None, &label)?;
    if port > u16::MAX as u64 {
        return Err(ValidationError::new(&label, "port", "must be at most 65535"));
    }

    let cpu = positive_int(map, "cpu", Some(DEFAULT_CPU), &label)?;
    let memory = positive_int(map, "memory", Some(DEFAULT_MEMORY), &label)?;
    let desired_count = positive_int(map, "desiredCount", Some(DEFAULT_DESIRED_COUNT), &label)?;

    Ok(ServiceSpec {
        name,
        port: port as u16,
        cpu: to_u32(cpu, "cpu", &label)?,
        memory: to_u32(memory, "memory", &label)?,
        desired_count: to_u32(desired_count, "desiredCount", &label)?,
        secrets: parse_secrets(map, &label)?,
        public_lb: parse_public_lb(map, &label)?,
    })
}

fn parse_secrets(map: &Mapping, label: &str) -> Result<Vec<SecretRef>, ValidationError> {
    let entries = match map.get("secrets") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Sequence(entries)) => entries,
        Some(_) => return Err(ValidationError::new(label, "secrets", "must be a list")),
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, secret)| {
            let field = format!("secrets[{}]", i);
            let secret = secret
                .as_mapping()
                .ok_or_else(|| ValidationError::new(label, &field, "must be a mapping"))?;
            let name = required_string(secret, "name", label)
                .map_err(|e| ValidationError::new(label, format!("{}.name", field), e.reason))?;
            Ok(SecretRef { name })
        })
        .collect()
}

fn parse_public_lb(map: &Mapping, label: &str) -> Result<Option<PublicExposure>, ValidationError> {
    let lb = match map.get("publicLb") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Mapping(lb)) => lb,
        Some(_) => return Err(ValidationError::new(label, "publicLb", "must be a mapping")),
    };

    let domain_head = required_string(lb, "domainHead", label)
        .map_err(|e| ValidationError::new(label, "publicLb.domainHead", e.reason))?;
    if !dns_label_pattern().is_match(&domain_head) {
        return Err(ValidationError::new(
            label,
            "publicLb.domainHead",
            format!("'{}' is not a lowercase DNS label", domain_head),
        ));
    }

    Ok(Some(PublicExposure { domain_head }))
}

fn required_string(map: &Mapping, key: &str, label: &str) -> Result<String, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Err(ValidationError::new(label, key, "is required")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationError::new(label, key, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::new(label, key, "must be a string")),
    }
}

fn optional_string(map: &Mapping, key: &str, label: &str) -> Result<Option<String>, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_string(map, key, label).map(Some),
    }
}

fn positive_int(
    map: &Mapping,
    key: &str,
    default: Option<u64>,
    label: &str,
) -> Result<u64, ValidationError> {
    let value = match (map.get(key), default) {
        (None | Some(Value::Null), Some(default)) => return Ok(default),
        (None | Some(Value::Null), None) => {
            return Err(ValidationError::new(label, key, "is required"))
        }
        (Some(value), _) => value,
    };

    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) if v > 0 => Ok(v as u64),
            Some(_) => Err(ValidationError::new(label, key, "must be a positive integer")),
            None => Err(ValidationError::new(label, key, "must be an integer")),
        },
        _ => Err(ValidationError::new(label, key, "must be an integer")),
    }
}

fn to_u32(value: u64, key: &str, label: &str) -> Result<u32, ValidationError> {
    u32::try_from(value).map_err(|_| ValidationError::new(label, key, "is too large"))
}
