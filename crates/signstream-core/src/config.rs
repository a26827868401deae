//! Application configuration — serde structs loaded from a JSON file
//! with environment-variable overrides.

use crate::error::{Error, Result};
use crate::types::QualityProfile;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub video: VideoConfig,
    pub extractor: ExtractorConfig,
    pub gesture: GestureConfig,
    pub pool: PoolConfig,
    pub llm: LlmConfig,
    pub limits: ResourceLimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Name of the quality preset active before the first adaptation.
    pub default_profile: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            default_profile: "medium".to_string(),
        }
    }
}

impl VideoConfig {
    pub fn default_quality_profile(&self) -> QualityProfile {
        QualityProfile::from_name(&self.default_profile).unwrap_or(QualityProfile::Medium)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Fallback complexity when no profile is available: 0 fast, 1 medium, 2 accurate.
    pub default_complexity: u8,
    pub detection_confidence: f32,
    pub tracking_confidence: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            default_complexity: 1,
            detection_confidence: 0.5,
            tracking_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GestureConfig {
    pub enabled: bool,
    /// Normalized units per second above which hands count as moving.
    pub velocity_threshold: f64,
    pub pause_duration_ms: u64,
    pub min_gesture_duration_ms: u64,
    pub landmark_buffer_size: usize,
    pub smoothing_window: usize,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            velocity_threshold: 0.02,
            pause_duration_ms: 1000,
            min_gesture_duration_ms: 500,
            landmark_buffer_size: 150,
            smoothing_window: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Per-client ingress queue bound; overflow drops frames.
    pub max_queue_size: usize,
    pub health_check_interval_secs: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_queue_size: 100,
            health_check_interval_secs: 30,
            batch_size: 10,
            batch_timeout_ms: 10,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub story_model: String,
    pub analysis_model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            story_model: "llama3.1".to_string(),
            analysis_model: "llama3.1".to_string(),
            timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    /// Consecutive violations before enforcement kicks in.
    pub violation_threshold: u32,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_percent: 80.0,
            violation_threshold: 5,
        }
    }
}

impl AppConfig {
    /// Load from a JSON file, then apply environment overrides.
    /// Startup fails on an unreadable or invalid file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("SIGNSTREAM_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SIGNSTREAM_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(level) = std::env::var("SIGNSTREAM_LOG") {
            self.server.log_level = level;
        }
        if let Ok(url) = std::env::var("SIGNSTREAM_LLM_URL") {
            self.llm.base_url = url;
        }
        if let Ok(key) = std::env::var("SIGNSTREAM_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pool.max_queue_size == 0 {
            return Err(Error::Config("pool.max_queue_size must be > 0".into()));
        }
        if self.pool.batch_size == 0 {
            return Err(Error::Config("pool.batch_size must be > 0".into()));
        }
        if self.gesture.smoothing_window == 0 {
            return Err(Error::Config("gesture.smoothing_window must be > 0".into()));
        }
        if QualityProfile::from_name(&self.video.default_profile).is_none() {
            return Err(Error::Config(format!(
                "unknown video.default_profile: {}",
                self.video.default_profile
            )));
        }
        Ok(())
    }

    /// Config subset safe to expose over HTTP (no API key).
    pub fn safe_subset(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "log_level": self.server.log_level,
                "max_connections": self.server.max_connections,
            },
            "video": { "default_profile": self.video.default_profile },
            "gesture": {
                "enabled": self.gesture.enabled,
                "velocity_threshold": self.gesture.velocity_threshold,
                "pause_duration_ms": self.gesture.pause_duration_ms,
                "min_gesture_duration_ms": self.gesture.min_gesture_duration_ms,
            },
            "pool": {
                "max_connections": self.pool.max_connections,
                "max_queue_size": self.pool.max_queue_size,
                "batch_size": self.pool.batch_size,
            },
            "llm": {
                "base_url": self.llm.base_url,
                "story_model": self.llm.story_model,
                "analysis_model": self.llm.analysis_model,
            },
        })
    }
}
