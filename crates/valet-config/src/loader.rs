use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::ValetConfig;

/// Loads the Valet configuration and holds the shared live copy.
pub struct ConfigLoader {
    config: Arc<RwLock<ValetConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > VALET_CONFIG env > ~/.valet/valet.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("VALET_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".valet")
            .join("valet.toml")
    }

    /// Load the config from disk, falling back to defaults when the file is
    /// absent. Parse and validation failures are hard errors — a broken
    /// config never produces a running instance.
    pub fn load(path: Option<&Path>) -> valet_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<ValetConfig>(&raw).map_err(|e| {
                valet_core::ValetError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            ValetConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(valet_core::ValetError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> ValetConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<ValetConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (VALET_MODEL, VALET_LOG_LEVEL, ...).
    fn apply_env_overrides(mut config: ValetConfig) -> ValetConfig {
        if let Ok(v) = std::env::var("VALET_MODEL") {
            config.agent.model = v;
        }
        if let Ok(v) = std::env::var("VALET_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("VALET_MAX_ITERATIONS") {
            if let Ok(n) = v.parse::<u32>() {
                config.agent.max_iterations = n;
            }
        }
        if let Ok(v) = std::env::var("VALET_WORKING_DIR") {
            config.workspace.working_dir = PathBuf::from(v);
        }
        config
    }
}
