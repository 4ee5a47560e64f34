// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for an AEGIS chat node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Inference backend endpoint and model
// - Slot scheduler capacity
// - Streaming heartbeat / stall / partial-tag timings
// - Cognitive loop iteration caps, threshold and timeouts
// - HTTP server and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    /// Node metadata (name, labels, version)
    pub metadata: ManifestMetadata,

    /// Node configuration specification
    #[serde(default)]
    pub spec: NodeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub cognition: CognitionConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique stable node identifier (UUID recommended)
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Provider type; only "ollama" ships today
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Upper bound for one HTTP generation call
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_endpoint(),
            model: default_model(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently executing requests
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How often a queued request is told its position
    #[serde(default = "default_queue_heartbeat", with = "humantime_serde")]
    pub queue_heartbeat_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            queue_heartbeat_interval: default_queue_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Silence before a `pulse` frame is emitted
    #[serde(default = "default_pulse_interval", with = "humantime_serde")]
    pub pulse_interval: Duration,

    /// Silence (no tokens, pulses do not count) before the stream errors out
    #[serde(default = "default_hard_stall_timeout", with = "humantime_serde")]
    pub hard_stall_timeout: Duration,

    /// How long a possible partial tag is withheld before being flushed verbatim
    #[serde(default = "default_partial_tag_flush", with = "humantime_serde")]
    pub partial_tag_flush: Duration,

    /// Buffered frames between the request task and the connection
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            pulse_interval: default_pulse_interval(),
            hard_stall_timeout: default_hard_stall_timeout(),
            partial_tag_flush: default_partial_tag_flush(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitionConfig {
    #[serde(default = "default_max_iterations_per_plan")]
    pub max_iterations_per_plan: u32,

    #[serde(default = "default_max_total_iterations")]
    pub max_total_iterations: u32,

    /// Verify score at or above which an answer is accepted (0.0 - 1.0)
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,

    /// Deadline for any single stage call
    #[serde(default = "default_stage_timeout", with = "humantime_serde")]
    pub stage_timeout: Duration,

    /// Deadline for the whole loop, independent of iteration counts
    #[serde(default = "default_loop_timeout", with = "humantime_serde")]
    pub cognitive_loop_timeout: Duration,

    /// Bound on a remembered failure description, in characters
    #[serde(default = "default_failure_description_limit")]
    pub failure_description_limit: usize,
}

impl Default for CognitionConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_plan: default_max_iterations_per_plan(),
            max_total_iterations: default_max_total_iterations(),
            accept_threshold: default_accept_threshold(),
            stage_timeout: default_stage_timeout(),
            cognitive_loop_timeout: default_loop_timeout(),
            failure_description_limit: default_failure_description_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format ("compact" or "json")
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-chat-node".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_CONFIG_PATH environment variable
    /// 2. ./aegis-config.yaml (working directory)
    /// 3. ~/.aegis/config.yaml (user home)
    /// 4. /etc/aegis/config.yaml (system, Unix) or C:\ProgramData\Aegis\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/aegis/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Aegis\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AEGIS_SLOT_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) => {
                    tracing::info!("Environment override: AEGIS_SLOT_CAPACITY={}", capacity);
                    self.spec.scheduler.capacity = capacity;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for AEGIS_SLOT_CAPACITY: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("AEGIS_INFERENCE_ENDPOINT") {
            tracing::info!("Environment override: AEGIS_INFERENCE_ENDPOINT={}", val);
            self.spec.inference.endpoint = val;
        }

        if let Ok(val) = std::env::var("AEGIS_INFERENCE_MODEL") {
            tracing::info!("Environment override: AEGIS_INFERENCE_MODEL={}", val);
            self.spec.inference.model = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.node.id.is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }

        let inference = &self.spec.inference;
        if inference.provider != "ollama" {
            anyhow::bail!(
                "Unsupported inference provider '{}'. Supported: ollama",
                inference.provider
            );
        }
        if inference.endpoint.is_empty() {
            anyhow::bail!("spec.inference.endpoint cannot be empty");
        }
        if inference.model.is_empty() {
            anyhow::bail!("spec.inference.model cannot be empty");
        }

        if self.spec.scheduler.capacity == 0 {
            anyhow::bail!("spec.scheduler.capacity must be at least 1");
        }

        let streaming = &self.spec.streaming;
        if streaming.pulse_interval.is_zero() {
            anyhow::bail!("spec.streaming.pulse_interval must be greater than zero");
        }
        if streaming.pulse_interval >= streaming.hard_stall_timeout {
            anyhow::bail!(
                "spec.streaming.pulse_interval ({:?}) must be shorter than hard_stall_timeout ({:?})",
                streaming.pulse_interval,
                streaming.hard_stall_timeout
            );
        }
        if streaming.channel_capacity == 0 {
            anyhow::bail!("spec.streaming.channel_capacity must be at least 1");
        }

        let cognition = &self.spec.cognition;
        if !(0.0..=1.0).contains(&cognition.accept_threshold) {
            anyhow::bail!(
                "spec.cognition.accept_threshold must be within [0, 1], got {}",
                cognition.accept_threshold
            );
        }
        if cognition.max_iterations_per_plan == 0 {
            anyhow::bail!("spec.cognition.max_iterations_per_plan must be at least 1");
        }
        if cognition.max_total_iterations < cognition.max_iterations_per_plan {
            anyhow::bail!(
                "spec.cognition.max_total_iterations ({}) cannot be below max_iterations_per_plan ({})",
                cognition.max_total_iterations,
                cognition.max_iterations_per_plan
            );
        }
        if cognition.stage_timeout.is_zero() || cognition.cognitive_loop_timeout.is_zero() {
            anyhow::bail!("spec.cognition timeouts must be greater than zero");
        }
        if cognition.failure_description_limit == 0 {
            anyhow::bail!("spec.cognition.failure_description_limit must be at least 1");
        }

        Ok(())
    }
}

// Default value functions
fn default_provider() -> String {
    "ollama".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_capacity() -> usize {
    2
}

fn default_queue_heartbeat() -> Duration {
    Duration::from_secs(1)
}

fn default_pulse_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_hard_stall_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_partial_tag_flush() -> Duration {
    Duration::from_millis(200)
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_iterations_per_plan() -> u32 {
    5
}

fn default_max_total_iterations() -> u32 {
    10
}

fn default_accept_threshold() -> f64 {
    0.75
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_loop_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_failure_description_limit() -> usize {
    200
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}
