use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::chat::ChatMessage;
use crate::function::FunctionMap;
use crate::sampling::SamplingParams;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Named model configurations (key = model name as used on the API).
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Tracing filter directive used when `RUST_LOG` is not set,
    /// e.g. "debug" or "info,lg_pool=trace".
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            log_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on live model instances across all models.
    #[serde(default = "d_concurrency")]
    pub concurrency: usize,
    /// Directory holding model weight files. Relative `ModelConfig.file`
    /// paths resolve under it. Defaults to a per-user cache directory.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: d_concurrency(),
            models_dir: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-model config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Weight file. Relative paths resolve under `pool.models_dir`.
    pub file: PathBuf,
    /// Source to download the file from when it is absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "d_context_size")]
    pub context_size: u32,
    #[serde(default)]
    pub engine: EngineOptions,
    /// Named grammar sources, compiled once per instance.
    #[serde(default)]
    pub grammars: HashMap<String, String>,
    #[serde(default)]
    pub preload: Option<Preload>,
    #[serde(default)]
    pub completion_defaults: SamplingParams,
    /// Model-invocable functions with host-side handlers. These are code,
    /// not data: registered on the config after load, never parsed from
    /// the config file.
    #[serde(skip)]
    pub functions: FunctionMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineOptions {
    #[serde(default)]
    pub gpu: GpuMode,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub cpu_threads: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub mem_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    #[default]
    Auto,
    Metal,
    Cuda,
    Vulkan,
}

/// Seed state evaluated at instance creation so matching request prefixes
/// hit a warm cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Preload {
    Messages { messages: Vec<ChatMessage> },
    Prefix { prefix: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Check the configuration for problems. Errors should abort startup;
    /// warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.pool.concurrency == 0 {
            issues.push(error("pool.concurrency must be at least 1".into()));
        }
        if self.models.is_empty() {
            issues.push(warning("no models configured; all requests will fail".into()));
        }

        for (name, model) in &self.models {
            if model.file.as_os_str().is_empty() {
                issues.push(error(format!("models.{name}: file must not be empty")));
            }
            if model.context_size == 0 {
                issues.push(error(format!(
                    "models.{name}: context_size must be at least 1"
                )));
            }
            if let Some(url) = &model.url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    issues.push(error(format!(
                        "models.{name}: url must be http(s), got {url}"
                    )));
                }
            }
            for (gname, source) in &model.grammars {
                if source.trim().is_empty() {
                    issues.push(error(format!("models.{name}: grammar {gname} is empty")));
                }
            }
            if let Some(Preload::Prefix { .. }) = &model.preload {
                issues.push(warning(format!(
                    "models.{name}: prefix preload is not supported yet and will be skipped"
                )));
            }
        }
        issues
    }
}

fn error(message: String) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        message,
    }
}

fn warning(message: String) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Warning,
        message,
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8643
}
fn d_concurrency() -> usize {
    1
}
fn d_context_size() -> u32 {
    4096
}
