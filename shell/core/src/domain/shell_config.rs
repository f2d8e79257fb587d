// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Shell Configuration Types
//
// Defines the configuration schema for the LHTML shell, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Sandbox limits (document size ceiling and its floor)
// - Event bus and logging settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::domain::quota::MIB;

pub const API_VERSION: &str = "lhtml/v1";
pub const KIND: &str = "ShellConfig";

/// Top-level Kubernetes-style shell configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfigManifest {
    /// API version (must be "lhtml/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ShellConfig")
    pub kind: String,

    #[serde(default)]
    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ShellConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Default for ManifestMetadata {
    fn default() -> Self {
        Self {
            name: "lhtml".to_string(),
            version: None,
        }
    }
}

/// Shell configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfigSpec {
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-document sandbox limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Document size ceiling in MiB
    #[serde(default = "default_max_doc_size_mb")]
    pub max_doc_size_mb: u64,

    /// Lowest ceiling a configuration may set, in MiB
    #[serde(default = "default_min_doc_size_mb")]
    pub min_doc_size_mb: u64,

    /// Grant size increases without asking
    #[serde(default)]
    pub auto_approve_size_increase: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_doc_size_mb: default_max_doc_size_mb(),
            min_doc_size_mb: default_min_doc_size_mb(),
            auto_approve_size_increase: false,
        }
    }
}

impl SandboxConfig {
    /// Starting ceiling for new documents, in bytes
    pub fn effective_max_bytes(&self) -> u64 {
        self.max_doc_size_mb
            .max(self.min_doc_size_mb)
            .saturating_mul(MIB)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer size; slow subscribers lose older events
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_max_doc_size_mb() -> u64 {
    10
}

fn default_min_doc_size_mb() -> u64 {
    5
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ShellConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata::default(),
            spec: ShellConfigSpec::default(),
        }
    }
}

impl ShellConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
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
    /// 1. LHTML_CONFIG_PATH environment variable
    /// 2. ./lhtml-config.yaml (working directory)
    /// 3. ~/.lhtml/config.yaml (user home)
    /// 4. /etc/lhtml/config.yaml (system, Unix) or C:\ProgramData\LHTML\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LHTML_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./lhtml-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lhtml").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/lhtml/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\LHTML\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("LHTML_MAX_DOC_SIZE_MB") {
            match val.trim().parse::<u64>() {
                Ok(mb) => {
                    tracing::info!("Environment override: LHTML_MAX_DOC_SIZE_MB={}", mb);
                    self.spec.sandbox.max_doc_size_mb = mb;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for LHTML_MAX_DOC_SIZE_MB: '{}'. Expected a whole number of MiB. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(val) = lookup("LHTML_AUTO_APPROVE_SIZE_INCREASE") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: LHTML_AUTO_APPROVE_SIZE_INCREASE=true");
                    self.spec.sandbox.auto_approve_size_increase = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: LHTML_AUTO_APPROVE_SIZE_INCREASE=false");
                    self.spec.sandbox.auto_approve_size_increase = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for LHTML_AUTO_APPROVE_SIZE_INCREASE: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
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

        let sandbox = &self.spec.sandbox;
        if sandbox.max_doc_size_mb == 0 {
            anyhow::bail!("spec.sandbox.max_doc_size_mb must be greater than zero");
        }
        if sandbox.min_doc_size_mb == 0 {
            anyhow::bail!("spec.sandbox.min_doc_size_mb must be greater than zero");
        }

        if self.spec.events.capacity == 0 {
            anyhow::bail!("spec.events.capacity must be greater than zero");
        }

        Ok(())
    }
}
